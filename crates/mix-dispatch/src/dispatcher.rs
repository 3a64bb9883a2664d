//! 送信キューと受信パケットの振り分け
//!
//! 送信側は in-flight 上限（セマフォ）で呼び出し側を待たせ、パケットを
//! FIFO キューに積む。Data パケットは `(payload_id, seq)` ごとに ACK を待ち、
//! ACK が届くか期限切れになるまで許可を保持する。
//!
//! 受信側は ACK を送信待ちと照合し、Data は到着順に再組み立てに回す。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use mix_transport::{Packet, PayloadId, Reassembler, TransportError};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::handle::{AckHandle, AckSender};

/// ACK 待ちの送信済みパケット
struct PendingAck {
    /// ACK されるまで in-flight 枠を占有する
    _permit: OwnedSemaphorePermit,
    tx: AckSender,
    submitted_ms: u64,
}

/// 組み立て終わった受信 Payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub payload_id: PayloadId,
    pub payload: Bytes,
}

/// `on_receive` の結果
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Inbound {
    /// 相手に返すべき ACK
    pub ack: Option<Packet>,
    /// 組み立てが完了した Payload
    pub message: Option<ReceivedMessage>,
}

/// ディスパッチャの統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: u64,
    pub acknowledged: u64,
    pub ack_timeouts: u64,
    pub unmatched: u64,
    pub delivered: u64,
    pub reassembly_timeouts: u64,
    pub in_flight: usize,
    pub pending_reassembly: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    acknowledged: AtomicU64,
    ack_timeouts: AtomicU64,
    unmatched: AtomicU64,
    delivered: AtomicU64,
    reassembly_timeouts: AtomicU64,
}

/// 送信キューの受け口（送信ループが 1 つだけ持つ）
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl OutboundQueue {
    /// 次に送るパケット。ディスパッチャが破棄されたら `None`。
    pub async fn next(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// 待たずに取り出す
    pub fn try_next(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }
}

/// パケットディスパッチャ
pub struct Dispatcher {
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    outbound: mpsc::UnboundedSender<Packet>,
    pending: Mutex<HashMap<(PayloadId, u16), PendingAck>>,
    reassembler: Mutex<Reassembler>,
    counters: Counters,
    /// 新しい送信を受け付けない（キューに積まれた分は送る）
    stopped: AtomicBool,
    closed: AtomicBool,
}

impl Dispatcher {
    /// ディスパッチャと、その送信キューの受け口を作る
    pub fn new(config: DispatcherConfig) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reassembler = Reassembler::new(config.reassembly_timeout.as_millis() as u64);
        let dispatcher = Dispatcher {
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            reassembler: Mutex::new(reassembler),
            counters: Counters::default(),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        (dispatcher, OutboundQueue { rx })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// パケットを送信キューに積む
    ///
    /// in-flight が上限に達していれば枠が空くまで待つ（捨てない）。
    /// Data パケットは ACK を待つハンドルを返し、それ以外は積んだ時点で完了する。
    ///
    /// # エラー
    /// - `DispatchError::SessionClosed`: `stop_accepting()` / `close()` 済み、
    ///   または待っている間にそうなった
    pub async fn submit(&self, packet: Packet, now_ms: u64) -> Result<AckHandle, DispatchError> {
        if !self.is_accepting() {
            return Err(DispatchError::SessionClosed);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::SessionClosed)?;
        if !self.is_accepting() {
            return Err(DispatchError::SessionClosed);
        }

        let Packet::Data(frag) = &packet else {
            self.enqueue(packet)?;
            drop(permit);
            return Ok(AckHandle::ready());
        };

        let key = (frag.payload_id, frag.seq);
        let (tx, handle) = AckHandle::waiting();
        let replaced = self.lock_pending().insert(
            key,
            PendingAck {
                _permit: permit,
                tx,
                submitted_ms: now_ms,
            },
        );
        if replaced.is_some() {
            warn!(payload_id = %key.0, seq = key.1, "fragment resubmitted before acknowledgement");
        }

        if let Err(e) = self.enqueue(packet) {
            self.lock_pending().remove(&key);
            return Err(e);
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn enqueue(&self, packet: Packet) -> Result<(), DispatchError> {
        self.outbound
            .send(packet)
            .map_err(|_| DispatchError::SessionClosed)
    }

    /// 受信パケットを処理する
    ///
    /// # 戻り値
    /// 返すべき ACK と、組み立てが完了した Payload
    ///
    /// # エラー
    /// - `DispatchError::UnmatchedPacket`: 対応のない ACK、組み立て済み Payload の Fragment
    /// - `DispatchError::Transport`: Fragment の矛盾・再組み立ての期限切れ
    pub fn on_receive(&self, packet: Packet, now_ms: u64) -> Result<Inbound, DispatchError> {
        match packet {
            Packet::Ack { payload_id, seq } => {
                let Some(pending) = self.lock_pending().remove(&(payload_id, seq)) else {
                    self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                    return Err(DispatchError::UnmatchedPacket { payload_id, seq });
                };
                // 受け手がハンドルを捨てていても枠は解放する
                let _ = pending.tx.send(Ok(()));
                self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                Ok(Inbound::default())
            }
            Packet::Data(frag) => {
                let payload_id = frag.payload_id;
                let seq = frag.seq;
                let mut reassembler = self
                    .reassembler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);

                if reassembler.is_completed(&payload_id) {
                    self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                    return Err(DispatchError::UnmatchedPacket { payload_id, seq });
                }

                let was_pending = reassembler.is_pending(&payload_id);
                let assembled = match reassembler.reassemble(frag, now_ms) {
                    Ok(assembled) => assembled,
                    Err(e) => {
                        // 期限切れ済みの id への遅れた Fragment は数えない
                        if was_pending && matches!(e, TransportError::Timeout { .. }) {
                            self.counters.reassembly_timeouts.fetch_add(1, Ordering::Relaxed);
                        }
                        return Err(e.into());
                    }
                };

                let message = assembled.map(|payload| {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    ReceivedMessage {
                        payload_id,
                        payload,
                    }
                });
                Ok(Inbound {
                    ack: Some(Packet::Ack { payload_id, seq }),
                    message,
                })
            }
            Packet::Keepalive | Packet::Handshake(_) | Packet::Close(_) => Ok(Inbound::default()),
        }
    }

    /// 期限切れの ACK 待ちと組み立て途中の Payload を片付ける
    ///
    /// ACK 待ちのハンドルには `Timeout` を通知する。組み立て途中のものは黙って捨てる。
    /// 期限切れにした ACK 待ちの数を返す。
    pub fn expire(&self, now_ms: u64) -> usize {
        let ack_timeout_ms = self.config.ack_timeout.as_millis() as u64;
        let expired: Vec<((PayloadId, u16), PendingAck)> = {
            let mut pending = self.lock_pending();
            let keys: Vec<(PayloadId, u16)> = pending
                .iter()
                .filter(|(_, p)| now_ms.saturating_sub(p.submitted_ms) >= ack_timeout_ms)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|p| (key, p)))
                .collect()
        };

        let count = expired.len();
        for ((payload_id, seq), pending) in expired {
            debug!(payload_id = %payload_id, seq, "acknowledgement timed out");
            let _ = pending.tx.send(Err(DispatchError::Timeout { payload_id, seq }));
        }
        self.counters
            .ack_timeouts
            .fetch_add(count as u64, Ordering::Relaxed);

        let dropped = self
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expire(now_ms);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropped incomplete payloads");
            self.counters
                .reassembly_timeouts
                .fetch_add(dropped.len() as u64, Ordering::Relaxed);
        }
        count
    }

    /// 以後の `submit` を拒否する
    ///
    /// 積まれたパケットと ACK 待ちはそのまま残るので、送信ループが
    /// キューを送り切ってから `close()` する。
    pub fn stop_accepting(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("dispatcher stopped accepting packets");
        }
    }

    /// `submit` を受け付けるか
    pub fn is_accepting(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    /// すべての ACK 待ちを `SessionClosed` で失敗させ、以後の送信を拒否する
    ///
    /// 枠待ちで止まっている呼び出し側も起こす。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let drained: Vec<PendingAck> = self.lock_pending().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending acknowledgements");
        }
        for pending in drained {
            let _ = pending.tx.send(Err(DispatchError::SessionClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// ACK 待ちで枠を占有しているパケット数
    pub fn in_flight(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn stats(&self) -> DispatchStats {
        let pending_reassembly = self
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_count();
        DispatchStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            ack_timeouts: self.counters.ack_timeouts.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            reassembly_timeouts: self.counters.reassembly_timeouts.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            pending_reassembly,
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<(PayloadId, u16), PendingAck>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mix_transport::{fragment, Fragment};
    use tokio::time::timeout;

    fn data(id: u8, seq: u16, total: u16) -> Packet {
        Packet::Data(Fragment {
            payload_id: PayloadId([id; 16]),
            seq,
            total,
            data: Bytes::from_static(b"xyz"),
        })
    }

    fn ack(id: u8, seq: u16) -> Packet {
        Packet::Ack {
            payload_id: PayloadId([id; 16]),
            seq,
        }
    }

    fn dispatcher(max_in_flight: usize) -> (Dispatcher, OutboundQueue) {
        Dispatcher::new(DispatcherConfig {
            max_in_flight,
            ack_timeout: Duration::from_millis(1000),
            reassembly_timeout: Duration::from_millis(5000),
        })
    }

    #[tokio::test]
    async fn test_ack_resolves_handle() {
        let (d, mut queue) = dispatcher(4);
        let handle = d.submit(data(1, 0, 1), 0).await.unwrap();
        assert_eq!(queue.next().await, Some(data(1, 0, 1)));
        assert_eq!(d.in_flight(), 1);

        assert_eq!(d.on_receive(ack(1, 0), 5).unwrap(), Inbound::default());
        handle.acknowledged().await.unwrap();
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_cap_blocks_until_ack() {
        let (d, _queue) = dispatcher(2);
        let _a = d.submit(data(1, 0, 3), 0).await.unwrap();
        let _b = d.submit(data(1, 1, 3), 0).await.unwrap();

        // 3 つ目は枠が空くまで待たされる
        assert!(timeout(Duration::from_millis(50), d.submit(data(1, 2, 3), 0))
            .await
            .is_err());

        let d = Arc::new(d);
        let third = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(data(1, 2, 3), 0).await })
        };
        tokio::task::yield_now().await;
        assert!(!third.is_finished());

        d.on_receive(ack(1, 0), 1).unwrap();
        let handle = third.await.unwrap().unwrap();
        assert_eq!(d.in_flight(), 2);
        drop(handle);
    }

    #[tokio::test]
    async fn test_control_packets_release_permit() {
        let (d, mut queue) = dispatcher(1);
        for _ in 0..3 {
            d.submit(Packet::Keepalive, 0)
                .await
                .unwrap()
                .acknowledged()
                .await
                .unwrap();
        }
        assert_eq!(d.in_flight(), 0);
        assert_eq!(queue.try_next(), Some(Packet::Keepalive));
    }

    #[tokio::test]
    async fn test_outbound_queue_is_fifo() {
        let (d, mut queue) = dispatcher(8);
        let _h1 = d.submit(data(1, 0, 2), 0).await.unwrap();
        d.submit(Packet::Keepalive, 0).await.unwrap();
        let _h2 = d.submit(data(1, 1, 2), 0).await.unwrap();

        assert_eq!(queue.try_next(), Some(data(1, 0, 2)));
        assert_eq!(queue.try_next(), Some(Packet::Keepalive));
        assert_eq!(queue.try_next(), Some(data(1, 1, 2)));
        assert_eq!(queue.try_next(), None);
    }

    #[tokio::test]
    async fn test_unknown_ack_is_unmatched() {
        let (d, _queue) = dispatcher(4);
        assert_eq!(
            d.on_receive(ack(9, 0), 0),
            Err(DispatchError::UnmatchedPacket {
                payload_id: PayloadId([9; 16]),
                seq: 0
            })
        );
        assert_eq!(d.stats().unmatched, 1);
    }

    #[tokio::test]
    async fn test_data_is_acked_and_reassembled() {
        let (d, _queue) = dispatcher(4);
        let payload: Bytes = (0..5000u32).map(|i| (i % 253) as u8).collect::<Vec<_>>().into();
        let frags = fragment(PayloadId([3; 16]), payload.clone(), 1200).unwrap();

        let mut message = None;
        for i in [3usize, 1, 4, 2, 0] {
            let inbound = d.on_receive(Packet::Data(frags[i].clone()), 10).unwrap();
            assert_eq!(
                inbound.ack,
                Some(Packet::Ack {
                    payload_id: PayloadId([3; 16]),
                    seq: i as u16
                })
            );
            if inbound.message.is_some() {
                message = inbound.message;
            }
        }
        assert_eq!(message.unwrap().payload, payload);

        // 組み立て済み Payload の遅れた重複
        assert!(matches!(
            d.on_receive(Packet::Data(frags[0].clone()), 11),
            Err(DispatchError::UnmatchedPacket { seq: 0, .. })
        ));
        assert_eq!(d.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_inconsistent_fragment_is_error() {
        let (d, _queue) = dispatcher(4);
        assert!(matches!(
            d.on_receive(data(1, 5, 2), 0),
            Err(DispatchError::Transport(TransportError::OutOfOrderDiscard { .. }))
        ));
    }

    #[tokio::test]
    async fn test_expire_fails_handles_and_frees_slots() {
        let (d, _queue) = dispatcher(1);
        let handle = d.submit(data(1, 0, 1), 0).await.unwrap();

        assert_eq!(d.expire(999), 0);
        assert_eq!(d.expire(1000), 1);
        assert_eq!(
            handle.acknowledged().await,
            Err(DispatchError::Timeout {
                payload_id: PayloadId([1; 16]),
                seq: 0
            })
        );
        // 枠が空いたので次を積める
        let _next = d.submit(data(2, 0, 1), 1000).await.unwrap();
        // 期限切れ後の ACK は照合できない
        assert!(d.on_receive(ack(1, 0), 1001).is_err());
    }

    #[tokio::test]
    async fn test_expire_drops_partial_payloads() {
        let (d, _queue) = dispatcher(1);
        d.on_receive(data(4, 0, 2), 0).unwrap();
        assert_eq!(d.stats().pending_reassembly, 1);
        d.expire(5000);
        let stats = d.stats();
        assert_eq!(stats.pending_reassembly, 0);
        assert_eq!(stats.reassembly_timeouts, 1);

        // 破棄した Payload の残りは ACK せず、途中状態も作らない
        assert!(matches!(
            d.on_receive(data(4, 1, 2), 5001),
            Err(DispatchError::Transport(TransportError::Timeout { .. }))
        ));
        let stats = d.stats();
        assert_eq!(stats.pending_reassembly, 0);
        assert_eq!(stats.reassembly_timeouts, 1);
    }

    #[tokio::test]
    async fn test_stop_accepting_keeps_queued_packets() {
        let (d, mut queue) = dispatcher(4);
        let handle = d.submit(data(1, 0, 1), 0).await.unwrap();

        d.stop_accepting();
        assert!(!d.is_accepting());
        assert!(!d.is_closed());
        assert!(matches!(
            d.submit(data(2, 0, 1), 0).await,
            Err(DispatchError::SessionClosed)
        ));

        // 積まれた分は取り出せて、ACK も照合できる
        assert_eq!(queue.try_next(), Some(data(1, 0, 1)));
        assert_eq!(queue.try_next(), None);
        d.on_receive(ack(1, 0), 1).unwrap();
        handle.acknowledged().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_accepting_rejects_waiting_submitter() {
        let (d, _queue) = dispatcher(1);
        let d = Arc::new(d);
        let _first = d.submit(data(1, 0, 2), 0).await.unwrap();

        let waiting = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(data(1, 1, 2), 0).await })
        };
        tokio::task::yield_now().await;

        d.stop_accepting();
        // 枠が空いても、止めたあとに積むことはない
        d.on_receive(ack(1, 0), 1).unwrap();
        assert!(matches!(waiting.await.unwrap(), Err(DispatchError::SessionClosed)));
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_waiting() {
        let (d, _queue) = dispatcher(1);
        let d = Arc::new(d);
        let handle = d.submit(data(1, 0, 1), 0).await.unwrap();

        let waiting = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(data(1, 1, 2), 0).await })
        };
        tokio::task::yield_now().await;

        d.close();
        assert_eq!(handle.acknowledged().await, Err(DispatchError::SessionClosed));
        assert!(matches!(waiting.await.unwrap(), Err(DispatchError::SessionClosed)));
        assert!(matches!(
            d.submit(Packet::Keepalive, 0).await,
            Err(DispatchError::SessionClosed)
        ));
        assert!(d.is_closed());
    }
}
