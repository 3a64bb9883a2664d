//! # mix-crypto
//!
//! ゲートウェイセッションの暗号プリミティブ。
//!
//! パケット本体の封緘（AES-128-OCB3）、受信側のリプレイ検出、
//! ハンドシェイクでの鍵交換を提供する。上位クレートは [`PacketSealer`] /
//! [`PacketOpener`] / [`KeyExchange`] の trait だけを通して呼び出す。
//!
//! ## 封緘済みボディ
//!
//! ```text
//! [nonce_tail: 8bytes][ciphertext: variable][auth_tag: 16bytes]
//!
//! Nonce（12バイト）:
//!   bytes[0..4]  = 0x00000000 (ゼロパディング、送信時省略)
//!   bytes[4..12] = direction_seq as u64, big-endian
//!
//! direction_seq:
//!   seq の MSB (bit 63) = direction (TO_GATEWAY=0, TO_CLIENT=1)
//! ```

mod error;
mod kex;
mod nonce;
mod plain;
mod replay;
mod session;

pub use error::CryptoError;
pub use kex::{
    key_confirmation, nonce_from_slice, random_nonce, verify_key_confirmation, KeyExchange,
    PresharedKeyExchange, HANDSHAKE_NONCE_LEN,
};
pub use nonce::PacketNonce;
pub use plain::NullCipher;
pub use replay::{ReplayWindow, REPLAY_WINDOW};
pub use session::{CryptoSession, OpeningKey, SealingKey};

/// 封緘によるサイズ増加（nonce_tail 8 + auth_tag 16）
pub const SEAL_OVERHEAD: usize = 24;

/// パケット本体を封緘する能力
pub trait PacketSealer: Send {
    /// `plaintext` を封緘する。出力長は常に `plaintext.len() + SEAL_OVERHEAD`。
    fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// 封緘済みパケット本体を開く能力
pub trait PacketOpener: Send {
    fn open(&mut self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// パケットの方向（TO_GATEWAY or TO_CLIENT）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// クライアント → ゲートウェイ (bit 63 = 0)
    ToGateway = 0,
    /// ゲートウェイ → クライアント (bit 63 = 1)
    ToClient = 1,
}

impl Direction {
    const BIT: u64 = 1u64 << 63;

    /// seq の MSB から方向を判定する
    pub fn from_seq(direction_seq: u64) -> Self {
        if direction_seq & Self::BIT == 0 {
            Direction::ToGateway
        } else {
            Direction::ToClient
        }
    }

    /// direction を seq の MSB に適用する
    pub fn apply_to_seq(&self, seq: u64) -> u64 {
        match self {
            Direction::ToGateway => seq & !Self::BIT,
            Direction::ToClient => seq | Self::BIT,
        }
    }

    /// direction ビットを落とした seq
    pub fn strip_seq(direction_seq: u64) -> u64 {
        direction_seq & !Self::BIT
    }

    /// 逆方向
    pub fn reverse(&self) -> Self {
        match self {
            Direction::ToGateway => Direction::ToClient,
            Direction::ToClient => Direction::ToGateway,
        }
    }
}

/// ハンドシェイクで導出した 16 バイトのセッション鍵
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 16]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl core::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Base64 文字列（22文字）を 16 バイトの鍵にデコードする
///
/// キーフォーマット: `4NeCCgvZFe2RnPgrcU1PQw`（URL-safe, パディングなし）
pub fn decode_base64_key(key_b64: &str) -> Result<[u8; 16], CryptoError> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(key_b64.trim())
        .map_err(|_| CryptoError::InvalidBase64)?;

    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_seq() {
        assert_eq!(Direction::from_seq(0x0000000000000001u64), Direction::ToGateway);
        assert_eq!(Direction::from_seq(0x8000000000000001u64), Direction::ToClient);
    }

    #[test]
    fn test_direction_apply_and_strip() {
        let tc = Direction::ToClient.apply_to_seq(42);
        assert_eq!(tc >> 63, 1);
        assert_eq!(Direction::strip_seq(tc), 42);
        assert_eq!(Direction::ToGateway.apply_to_seq(tc), 42);
        assert_eq!(Direction::ToClient.reverse(), Direction::ToGateway);
    }

    #[test]
    fn test_decode_base64_key_valid() {
        let key = decode_base64_key("AAAAAAAAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(key, [0u8; 16]);
    }

    #[test]
    fn test_decode_base64_key_invalid_length() {
        assert_eq!(decode_base64_key("AAAAAAAAAAAAAA"), Err(CryptoError::InvalidKeyLength));
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKey::from_bytes([0xAB; 16]);
        assert_eq!(format!("{:?}", key), "SessionKey(..)");
    }
}
