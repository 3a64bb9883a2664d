//! mix-session エラー型

use std::io;

use mix_crypto::CryptoError;
use mix_proto::ProtoError;
use mix_transport::{PacketKind, TransportError};
use thiserror::Error;

use crate::state::SessionState;

/// セッション層のエラー
#[derive(Debug, Error)]
pub enum SessionError {
    /// リトライを含めてハンドシェイクが成立しなかった
    #[error("Handshake failed after {attempts} attempt(s): {reason}")]
    HandshakeFailed { attempts: u32, reason: String },
    /// ゲートウェイが一定時間内に応答しなかった
    #[error("Handshake timed out")]
    HandshakeTimeout,
    /// ゲートウェイが接続を拒否した
    #[error("Gateway rejected handshake: {0}")]
    HandshakeRejected(String),
    /// 鍵確認値が一致しない（事前共有鍵の不一致）
    #[error("Key confirmation mismatch")]
    KeyConfirmationFailed,
    /// ハンドシェイク中に想定外のパケットを受け取った
    #[error("Unexpected {0:?} packet during handshake")]
    UnexpectedPacket(PacketKind),
    /// セッションが確立していない
    #[error("Not connected")]
    NotConnected,
    /// ゲートウェイ側の切断、EOF、または生存確認の失敗
    #[error("Session closed")]
    SessionClosed,
    /// 現在の状態では実行できない操作
    #[error("Invalid session state: {0}")]
    InvalidState(SessionState),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Handshake message error: {0}")]
    Proto(#[from] ProtoError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl SessionError {
    /// リトライで回復しうるエラーか
    ///
    /// バージョン不一致・拒否・鍵の不一致は何度繰り返しても同じ結果になる。
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::HandshakeTimeout | SessionError::Io(_) | SessionError::SessionClosed => {
                true
            }
            SessionError::Transport(TransportError::UnsupportedVersion(_)) => false,
            SessionError::Transport(_) => true,
            SessionError::HandshakeFailed { .. }
            | SessionError::HandshakeRejected(_)
            | SessionError::KeyConfirmationFailed
            | SessionError::UnexpectedPacket(_)
            | SessionError::NotConnected
            | SessionError::InvalidState(_)
            | SessionError::Proto(_)
            | SessionError::Crypto(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SessionError::HandshakeTimeout.is_transient());
        assert!(SessionError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).is_transient());
        assert!(SessionError::Transport(TransportError::MalformedPacket("x".into())).is_transient());

        assert!(!SessionError::Transport(TransportError::UnsupportedVersion(2)).is_transient());
        assert!(!SessionError::Proto(ProtoError::InvalidProtocolVersion(2)).is_transient());
        assert!(!SessionError::HandshakeRejected("full".into()).is_transient());
        assert!(!SessionError::KeyConfirmationFailed.is_transient());
    }
}
