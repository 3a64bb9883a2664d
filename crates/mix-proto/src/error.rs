//! mix-proto エラー型

use thiserror::Error;

/// Protobuf エンコード/デコードのエラー
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Protobuf デコード失敗
    #[error("Proto decode failed: {0}")]
    DecodeFailed(#[from] prost::DecodeError),
    /// プロトコルバージョン不一致
    #[error("Invalid protocol version: {0} (expected {expected})", expected = super::PROTOCOL_VERSION)]
    InvalidProtocolVersion(u32),
    /// 必須フィールドの欠落
    #[error("Missing field: {0}")]
    MissingField(&'static str),
}
