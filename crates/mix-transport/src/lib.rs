//! # mix-transport
//!
//! ゲートウェイとの間で交換する固定長パケットの層。
//!
//! アプリケーションの Payload を Fragment に分割/再組み立てする Framer と、
//! Fragment や制御メッセージを `packet_size` バイトのパケットに変換する
//! コーデックを提供する。
//!
//! ## パケットの全体構造
//!
//! ```text
//! offset  size  field
//! 0       1     version      (PROTOCOL_VERSION)
//! 1       1     kind         (0 Data, 1 Ack, 2 Keepalive, 3 Handshake, 4 Close)
//! 2       2     body_len     (u16 BE)
//! 4       2     fragment seq (u16 BE)
//! 6       2     fragment total (u16 BE)
//! 8       16    payload id
//! 24      ..    [nonce_tail: 8bytes][AEAD(body || zero pad)][auth_tag: 16bytes]
//! ```
//!
//! 先頭 24 バイトは AEAD の associated data。ボディ容量は
//! `packet_size - 24 - 24` バイト。

pub mod error;
pub mod fragment;
pub mod packet;

pub use error::TransportError;
pub use fragment::{fragment, Fragment, Fragmenter, PayloadId, Reassembler};
pub use packet::{
    Packet, PacketCodec, PacketHeader, PacketKind, DEFAULT_PACKET_SIZE, HEADER_LEN,
    MAX_PACKET_SIZE, MIN_PACKET_SIZE,
};
