//! mix-client エラー型

use mix_crypto::CryptoError;
use mix_dispatch::DispatchError;
use mix_session::SessionError;
use mix_transport::TransportError;
use thiserror::Error;

/// クライアントのエラー
#[derive(Debug, Error)]
pub enum ClientError {
    /// 設定値が不正
    #[error("Invalid config: {0}")]
    Config(String),
    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// `connect_timeout` までにセッションが確立しなかった、または切断済み
    #[error("Not connected")]
    NotConnected,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
