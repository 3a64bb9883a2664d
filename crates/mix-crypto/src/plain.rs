//! 鍵確立前のパケット用の恒等封緘
//!
//! ハンドシェイク中はまだ鍵がないが、パケットのレイアウトとサイズは変えたくない。
//! そこで nonce_tail と auth_tag の位置をゼロで埋めて `SEAL_OVERHEAD` を保つ。

use crate::error::CryptoError;
use crate::{PacketOpener, PacketSealer, SEAL_OVERHEAD};

const TAIL_LEN: usize = 8;

/// 暗号化しない封緘（ハンドシェイク専用）
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCipher;

impl PacketSealer for NullCipher {
    fn seal(&mut self, _aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut sealed = vec![0u8; plaintext.len() + SEAL_OVERHEAD];
        sealed[TAIL_LEN..TAIL_LEN + plaintext.len()].copy_from_slice(plaintext);
        Ok(sealed)
    }
}

impl PacketOpener for NullCipher {
    fn open(&mut self, _aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::PacketTooShort);
        }
        let tag_start = sealed.len() - (SEAL_OVERHEAD - TAIL_LEN);
        let framing_is_zero = sealed[..TAIL_LEN]
            .iter()
            .chain(&sealed[tag_start..])
            .all(|&b| b == 0);
        // 暗号化済みパケットを平文として解釈しない
        if !framing_is_zero {
            return Err(CryptoError::DecryptionFailed);
        }
        Ok(sealed[TAIL_LEN..tag_start].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CryptoSession, Direction, SessionKey};

    #[test]
    fn test_null_roundtrip_keeps_overhead() {
        let sealed = NullCipher.seal(b"", b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + SEAL_OVERHEAD);
        assert_eq!(NullCipher.open(b"", &sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_null_rejects_encrypted_body() {
        let key = SessionKey::from_bytes([1u8; 16]);
        let mut session = CryptoSession::new(&key, Direction::ToGateway);
        // seq 0 の nonce_tail はゼロなので、タグ側で弾かれる
        let sealed = session.seal(b"", b"payload").unwrap();
        assert_eq!(NullCipher.open(b"", &sealed), Err(CryptoError::DecryptionFailed));
    }
}
