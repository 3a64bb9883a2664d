//! Payload の Fragment 分割と再組み立て
//!
//! 一つの Payload が固定パケットの容量を超える場合、複数の Fragment に分割される。
//! Fragment はすべて同じ payload id と総数を持ち、総数分が揃った時点で
//! seq の順に結合して元の Payload に戻す。到着順は問わない。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::TransportError;

/// 完了済み・期限切れの payload id を覚えておく数（遅れて届いた Fragment の判定用）
const RECENT_MEMORY: usize = 1024;

/// Payload の識別子（16バイトの乱数）
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId(pub [u8; 16]);

impl PayloadId {
    pub const LEN: usize = 16;

    /// OS 乱数から新しい id を生成する
    pub fn random() -> Result<Self, TransportError> {
        Ok(PayloadId(mix_crypto::random_nonce()?))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ログ用に先頭 8 バイトだけ出す
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadId({})", self)
    }
}

/// Fragment（パケット 1 つに載る Payload の一部）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// この Fragment が属する Payload の id
    pub payload_id: PayloadId,
    /// Fragment 番号（0 始まり）
    pub seq: u16,
    /// この Payload の Fragment 総数（1 以上）
    pub total: u16,
    /// Fragment ペイロード（Payload バイト列の一部）
    pub data: Bytes,
}

impl Fragment {
    /// 最後の Fragment か
    pub fn is_final(&self) -> bool {
        self.seq + 1 == self.total
    }
}

/// Payload を Fragment 列に分割する
///
/// 空の Payload でも空の Fragment を 1 つ返す（ACK の単位を保つため）。
///
/// # エラー
/// - `TransportError::EncodingTooLarge`: `max_fragment_size` が 0、
///   または Fragment 数が `u16::MAX` を超える
pub fn fragment(
    payload_id: PayloadId,
    payload: Bytes,
    max_fragment_size: usize,
) -> Result<Vec<Fragment>, TransportError> {
    if max_fragment_size == 0 {
        return Err(TransportError::EncodingTooLarge {
            len: payload.len(),
            capacity: 0,
        });
    }

    let count = payload.len().div_ceil(max_fragment_size).max(1);
    let total = u16::try_from(count).map_err(|_| TransportError::EncodingTooLarge {
        len: payload.len(),
        capacity: max_fragment_size.saturating_mul(usize::from(u16::MAX)),
    })?;

    if payload.is_empty() {
        return Ok(vec![Fragment {
            payload_id,
            seq: 0,
            total: 1,
            data: Bytes::new(),
        }]);
    }

    let fragments = (0..total)
        .map(|seq| {
            let start = usize::from(seq) * max_fragment_size;
            let end = (start + max_fragment_size).min(payload.len());
            Fragment {
                payload_id,
                seq,
                total,
                data: payload.slice(start..end),
            }
        })
        .collect();

    Ok(fragments)
}

/// Payload を Fragment 列に分割するクラス
///
/// 呼び出しごとに新しい payload id を割り当てる。
#[derive(Debug, Clone)]
pub struct Fragmenter {
    /// Fragment ペイロードの最大バイト数
    max_fragment_size: usize,
}

impl Fragmenter {
    pub fn new(max_fragment_size: usize) -> Self {
        Fragmenter { max_fragment_size }
    }

    /// 新しい payload id で Payload を分割する
    pub fn fragment(
        &self,
        payload: impl Into<Bytes>,
    ) -> Result<(PayloadId, Vec<Fragment>), TransportError> {
        let payload_id = PayloadId::random()?;
        let fragments = fragment(payload_id, payload.into(), self.max_fragment_size)?;
        Ok((payload_id, fragments))
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }
}

/// 組み立て途中の Payload
#[derive(Debug)]
struct PartialPayload {
    total: u16,
    /// 受信済み Fragment（seq → data）
    arrived: BTreeMap<u16, Bytes>,
    /// 最初の Fragment を受け取った時刻（ミリ秒）
    started_ms: u64,
}

/// 最近の payload id の集合（古いものから忘れる）
#[derive(Debug, Default)]
struct RecentIds {
    ids: HashSet<PayloadId>,
    order: VecDeque<PayloadId>,
}

impl RecentIds {
    fn insert(&mut self, id: PayloadId) {
        if self.ids.insert(id) {
            self.order.push_back(id);
        }
        while self.order.len() > RECENT_MEMORY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: &PayloadId) -> bool {
        self.ids.contains(id)
    }
}

/// Fragment を受け取り、Payload に再組み立てするクラス
///
/// payload id ごとに独立して組み立てる。`window_ms` 以内に揃わなかった
/// Payload は途中状態ごと破棄し、その id に遅れて届いた Fragment は
/// `Timeout` で拒否し続ける。
#[derive(Debug)]
pub struct Reassembler {
    window_ms: u64,
    partials: HashMap<PayloadId, PartialPayload>,
    completed: RecentIds,
    timed_out: RecentIds,
}

impl Reassembler {
    pub fn new(window_ms: u64) -> Self {
        Reassembler {
            window_ms,
            partials: HashMap::new(),
            completed: RecentIds::default(),
            timed_out: RecentIds::default(),
        }
    }

    /// Fragment を追加する
    ///
    /// # 戻り値
    /// - `Ok(Some(payload))`: すべての Fragment が揃い、再組み立てした Payload
    /// - `Ok(None)`: まだ足りない（重複・完了済み Payload の Fragment もここ）
    ///
    /// # エラー
    /// - `OutOfOrderDiscard`: seq/total が矛盾（その payload の途中状態は破棄）
    /// - `Timeout`: ウィンドウを過ぎていた（その payload の途中状態は破棄）
    pub fn reassemble(
        &mut self,
        frag: Fragment,
        now_ms: u64,
    ) -> Result<Option<Bytes>, TransportError> {
        let id = frag.payload_id;
        let discard = TransportError::OutOfOrderDiscard {
            payload_id: id,
            seq: frag.seq,
            total: frag.total,
        };

        if frag.total == 0 || frag.seq >= frag.total {
            self.partials.remove(&id);
            return Err(discard);
        }
        if self.completed.contains(&id) {
            return Ok(None);
        }
        if self.timed_out.contains(&id) {
            return Err(TransportError::Timeout { payload_id: id });
        }

        if let Some(partial) = self.partials.get(&id) {
            if now_ms.saturating_sub(partial.started_ms) >= self.window_ms {
                self.partials.remove(&id);
                self.timed_out.insert(id);
                return Err(TransportError::Timeout { payload_id: id });
            }
            if partial.total != frag.total {
                self.partials.remove(&id);
                return Err(discard);
            }
        }

        let partial = self.partials.entry(id).or_insert_with(|| PartialPayload {
            total: frag.total,
            arrived: BTreeMap::new(),
            started_ms: now_ms,
        });
        partial.arrived.entry(frag.seq).or_insert(frag.data);

        if partial.arrived.len() < usize::from(partial.total) {
            return Ok(None);
        }

        let Some(partial) = self.partials.remove(&id) else {
            return Ok(None);
        };
        let len = partial.arrived.values().map(Bytes::len).sum();
        let mut assembled = BytesMut::with_capacity(len);
        for data in partial.arrived.values() {
            assembled.extend_from_slice(data);
        }
        self.completed.insert(id);

        Ok(Some(assembled.freeze()))
    }

    /// ウィンドウを過ぎた途中状態を破棄し、その payload id を返す
    pub fn expire(&mut self, now_ms: u64) -> Vec<PayloadId> {
        let window_ms = self.window_ms;
        let expired: Vec<PayloadId> = self
            .partials
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.started_ms) >= window_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.partials.remove(id);
            self.timed_out.insert(*id);
        }
        expired
    }

    /// 組み立て途中の Payload 数
    pub fn pending_count(&self) -> usize {
        self.partials.len()
    }

    /// 組み立て途中か
    pub fn is_pending(&self, id: &PayloadId) -> bool {
        self.partials.contains_key(id)
    }

    /// 最近組み立てを完了した id か
    pub fn is_completed(&self, id: &PayloadId) -> bool {
        self.completed.contains(id)
    }

    /// 期限切れで破棄した id か
    pub fn is_timed_out(&self, id: &PayloadId) -> bool {
        self.timed_out.contains(id)
    }
}
