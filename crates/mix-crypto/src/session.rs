//! AES-128-OCB3 セッション実装
//!
//! ゲートウェイとの暗号チャンネル。送信側（[`SealingKey`]）と受信側（[`OpeningKey`]）に
//! 分割でき、それぞれが自分のシーケンス状態だけを持つ。
//!
//! ## 封緘済みボディ構造
//! ```text
//! [nonce_tail: 8bytes][ciphertext: plaintext.len()][auth_tag: 16bytes]
//! ```
//! パケットヘッダーは associated data として認証される。

use aead::{Aead, KeyInit, Payload};
use aes::Aes128;
use ocb3::Ocb3;

use crate::error::CryptoError;
use crate::nonce::PacketNonce;
use crate::replay::ReplayWindow;
use crate::{Direction, PacketOpener, PacketSealer, SessionKey, SEAL_OVERHEAD};

/// AES-128-OCB3 (12バイト nonce, 16バイト tag) の型エイリアス
type Aes128Ocb3 = Ocb3<Aes128>;

/// 送信方向の鍵
///
/// 送信シーケンス番号を自動インクリメントし、Nonce の重複を防ぐ。
pub struct SealingKey {
    cipher: Aes128Ocb3,
    direction: Direction,
    /// 次の送信シーケンス番号
    send_seq: u64,
}

impl SealingKey {
    pub fn new(key: &SessionKey, direction: Direction) -> Self {
        SealingKey {
            cipher: Aes128Ocb3::new(key.as_bytes().into()),
            direction,
            send_seq: 0,
        }
    }

    /// 次に使う送信シーケンス番号
    pub fn send_seq(&self) -> u64 {
        self.send_seq
    }
}

impl PacketSealer for SealingKey {
    fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // 2^63 を超える送信は direction ビットと衝突するので拒否
        if self.send_seq >> 63 != 0 {
            return Err(CryptoError::EncryptionFailed);
        }
        let nonce = PacketNonce::for_direction(self.direction, self.send_seq);
        self.send_seq += 1;

        let ciphertext = self
            .cipher
            .encrypt(nonce.as_bytes().into(), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(PacketNonce::TAIL_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.tail_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }
}

/// 受信方向の鍵
///
/// 期待する方向以外のパケットと、リプレイウィンドウに引っかかるパケットを拒否する。
pub struct OpeningKey {
    cipher: Aes128Ocb3,
    direction: Direction,
    replay: ReplayWindow,
}

impl OpeningKey {
    pub fn new(key: &SessionKey, direction: Direction) -> Self {
        OpeningKey {
            cipher: Aes128Ocb3::new(key.as_bytes().into()),
            direction,
            replay: ReplayWindow::new(),
        }
    }

    /// 最後に受理したシーケンス番号
    pub fn highest_seq(&self) -> Option<u64> {
        self.replay.highest()
    }
}

impl PacketOpener for OpeningKey {
    fn open(&mut self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::PacketTooShort);
        }
        let nonce = PacketNonce::from_sealed_prefix(sealed).ok_or(CryptoError::PacketTooShort)?;
        if nonce.direction() != self.direction {
            return Err(CryptoError::WrongDirection);
        }
        let seq = nonce.seq();
        self.replay.check(seq)?;

        let plaintext = self
            .cipher
            .decrypt(
                nonce.as_bytes().into(),
                Payload { msg: &sealed[PacketNonce::TAIL_LEN..], aad },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        // 認証に成功したものだけをウィンドウに記録する
        self.replay.commit(seq);
        Ok(plaintext)
    }
}

/// AES-128-OCB3 暗号セッション
///
/// ハンドシェイクで導出したセッション鍵から、自分の送信方向と相手の送信方向の
/// 鍵ペアを作る。
pub struct CryptoSession {
    sealing: SealingKey,
    opening: OpeningKey,
}

impl CryptoSession {
    /// セッション鍵と自分の送信方向からセッションを初期化する
    pub fn new(key: &SessionKey, outbound: Direction) -> Self {
        CryptoSession {
            sealing: SealingKey::new(key, outbound),
            opening: OpeningKey::new(key, outbound.reverse()),
        }
    }

    /// 送信側と受信側に分割する（別々のタスクが所有できるように）
    pub fn split(self) -> (SealingKey, OpeningKey) {
        (self.sealing, self.opening)
    }

    /// 現在の送信シーケンス番号を返す
    pub fn send_seq(&self) -> u64 {
        self.sealing.send_seq()
    }
}

impl PacketSealer for CryptoSession {
    fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.sealing.seal(aad, plaintext)
    }
}

impl PacketOpener for CryptoSession {
    fn open(&mut self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.opening.open(aad, sealed)
    }
}
