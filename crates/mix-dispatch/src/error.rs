//! mix-dispatch エラー型

use mix_transport::{PayloadId, TransportError};
use thiserror::Error;

/// ディスパッチャのエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// 対応する送信待ちのない ACK、または組み立て済み Payload の Fragment
    #[error("Unmatched packet: payload {payload_id} seq {seq}")]
    UnmatchedPacket { payload_id: PayloadId, seq: u16 },
    /// ACK が制限時間内に届かなかった
    #[error("Acknowledgement timed out: payload {payload_id} seq {seq}")]
    Timeout { payload_id: PayloadId, seq: u16 },
    /// セッションが閉じられた
    #[error("Session closed")]
    SessionClosed,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
