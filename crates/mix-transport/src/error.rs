//! mix-transport エラー型

use mix_crypto::CryptoError;
use thiserror::Error;

use crate::fragment::PayloadId;

/// トランスポート層のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// 長さ・種別などが不正なパケット
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    /// ヘッダーのバージョンが未対応
    #[error("Unsupported packet version: {0}")]
    UnsupportedVersion(u8),
    /// 本体が固定パケットの容量を超える
    #[error("Encoding too large: {len} bytes exceeds capacity of {capacity}")]
    EncodingTooLarge { len: usize, capacity: usize },
    /// fragment 番号が宣言された総数と矛盾する
    #[error("Out-of-order fragment discarded: payload {payload_id} seq {seq} total {total}")]
    OutOfOrderDiscard { payload_id: PayloadId, seq: u16, total: u16 },
    /// 再組み立てウィンドウを過ぎた
    #[error("Reassembly timed out for payload {payload_id}")]
    Timeout { payload_id: PayloadId },
    /// パケットサイズ設定が不正
    #[error("Invalid packet size: {0}")]
    InvalidPacketSize(usize),
    /// 本体の封緘/開封の失敗
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
