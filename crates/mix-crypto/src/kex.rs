//! ゲートウェイとの鍵交換
//!
//! クライアントとゲートウェイがそれぞれ 16 バイトの nonce を出し合い、
//! [`KeyExchange`] 実装がそこからセッション鍵を導出する。
//! ゲートウェイは導出した鍵で作った確認値を返し、クライアントはそれを検証する。

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::CryptoError;
use crate::{decode_base64_key, SessionKey};

/// ハンドシェイク nonce の長さ
pub const HANDSHAKE_NONCE_LEN: usize = 16;

/// 鍵確認値の平文ラベル（16バイト = AES ブロック 1 つ）
const KEY_CONFIRMATION_LABEL: &[u8; 16] = b"mix-key-confirm!";

/// 鍵交換の能力
///
/// セッション管理側はこの trait を呼ぶだけで、プリミティブ自体は実装しない。
pub trait KeyExchange: Send + Sync {
    /// 両者の nonce からセッション鍵を導出する
    fn derive(
        &self,
        client_nonce: &[u8; HANDSHAKE_NONCE_LEN],
        gateway_nonce: &[u8; HANDSHAKE_NONCE_LEN],
    ) -> Result<SessionKey, CryptoError>;
}

/// 事前共有鍵による鍵交換
///
/// `key = AES_psk(AES_psk(client_nonce) XOR gateway_nonce)`
pub struct PresharedKeyExchange {
    psk: Aes128,
}

impl PresharedKeyExchange {
    pub fn new(psk: [u8; 16]) -> Self {
        PresharedKeyExchange {
            psk: Aes128::new(GenericArray::from_slice(&psk)),
        }
    }

    /// Base64 文字列（22文字, URL-safe no-pad）から初期化する
    pub fn from_base64(psk_b64: &str) -> Result<Self, CryptoError> {
        Ok(Self::new(decode_base64_key(psk_b64)?))
    }
}

impl KeyExchange for PresharedKeyExchange {
    fn derive(
        &self,
        client_nonce: &[u8; HANDSHAKE_NONCE_LEN],
        gateway_nonce: &[u8; HANDSHAKE_NONCE_LEN],
    ) -> Result<SessionKey, CryptoError> {
        let mut block = GenericArray::clone_from_slice(client_nonce);
        self.psk.encrypt_block(&mut block);
        for (b, g) in block.iter_mut().zip(gateway_nonce.iter()) {
            *b ^= g;
        }
        self.psk.encrypt_block(&mut block);

        let mut key = [0u8; 16];
        key.copy_from_slice(&block);
        Ok(SessionKey::from_bytes(key))
    }
}

/// セッション鍵の確認値（ゲートウェイが送り、クライアントが検証する）
pub fn key_confirmation(key: &SessionKey) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(KEY_CONFIRMATION_LABEL);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// 鍵確認値を比較する（長さ違いは不一致）
pub fn verify_key_confirmation(key: &SessionKey, confirmation: &[u8]) -> bool {
    let expected = key_confirmation(key);
    if confirmation.len() != expected.len() {
        return false;
    }
    // 途中で抜けない比較
    expected
        .iter()
        .zip(confirmation.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// OS 乱数からハンドシェイク nonce を生成する
pub fn random_nonce() -> Result<[u8; HANDSHAKE_NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(nonce)
}

/// 受信したバイト列を nonce 配列に変換する
pub fn nonce_from_slice(bytes: &[u8]) -> Result<[u8; HANDSHAKE_NONCE_LEN], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidNonceLength(bytes.len()))
}
