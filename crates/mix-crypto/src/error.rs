//! 暗号エラー型

use thiserror::Error;

/// 暗号操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 鍵の長さが不正（16バイト以外）
    #[error("Invalid key length (expected 16 bytes)")]
    InvalidKeyLength,
    /// Base64 デコードに失敗
    #[error("Invalid Base64 encoding")]
    InvalidBase64,
    /// 暗号化に失敗
    #[error("Encryption failed")]
    EncryptionFailed,
    /// 復号に失敗（認証タグ検証失敗を含む）
    #[error("Decryption failed (authentication tag mismatch)")]
    DecryptionFailed,
    /// リプレイ検出（seq が既に受信済み、またはウィンドウより古い）
    #[error("Replay detected: packet sequence number {0} already seen or too old")]
    ReplayAttack(u64),
    /// 自分が送った方向のパケットが返ってきた
    #[error("Packet direction mismatch")]
    WrongDirection,
    /// 封緘済みボディが短すぎる
    #[error("Sealed body too short")]
    PacketTooShort,
    /// ハンドシェイク nonce の長さが不正
    #[error("Invalid handshake nonce length: {0}")]
    InvalidNonceLength(usize),
    /// OS 乱数の取得に失敗
    #[error("Random number generation failed")]
    RandomUnavailable,
}
