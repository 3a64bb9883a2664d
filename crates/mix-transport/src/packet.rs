//! 固定長パケットのエンコード/デコード
//!
//! すべてのパケットは `packet_size` バイト丁度で送受信される。
//! ヘッダー 24 バイトは平文のまま AEAD の associated data として認証され、
//! 残りが封緘済みボディ領域になる。
//!
//! ## Wire Format
//! ```text
//! [version: u8][kind: u8][body_len: u16 BE][seq: u16 BE][total: u16 BE][payload_id: 16bytes]
//! [nonce_tail: 8bytes][AEAD(body || zero pad)][auth_tag: 16bytes]
//! ```

use bytes::Bytes;
use mix_crypto::{PacketOpener, PacketSealer, SEAL_OVERHEAD};
use mix_proto::PROTOCOL_VERSION;

use crate::error::TransportError;
use crate::fragment::{Fragment, PayloadId};

/// ヘッダーのバイト数
pub const HEADER_LEN: usize = 24;

/// 既定のパケットサイズ
pub const DEFAULT_PACKET_SIZE: usize = 2048;

/// 許容する最小のパケットサイズ（ハンドシェイクメッセージが収まること）
pub const MIN_PACKET_SIZE: usize = 128;

/// 許容する最大のパケットサイズ（body_len が u16 に収まること）
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize + HEADER_LEN + SEAL_OVERHEAD;

/// パケット種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0,
    Ack = 1,
    Keepalive = 2,
    Handshake = 3,
    Close = 4,
}

impl TryFrom<u8> for PacketKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::Data),
            1 => Ok(PacketKind::Ack),
            2 => Ok(PacketKind::Keepalive),
            3 => Ok(PacketKind::Handshake),
            4 => Ok(PacketKind::Close),
            other => Err(TransportError::MalformedPacket(format!(
                "unknown packet kind {}",
                other
            ))),
        }
    }
}

/// パケットの平文ヘッダー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub kind: PacketKind,
    /// ボディ領域のうち意味のある平文バイト数
    pub body_len: u16,
    pub seq: u16,
    pub total: u16,
    pub payload_id: PayloadId,
}

impl PacketHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.kind as u8;
        out[2..4].copy_from_slice(&self.body_len.to_be_bytes());
        out[4..6].copy_from_slice(&self.seq.to_be_bytes());
        out[6..8].copy_from_slice(&self.total.to_be_bytes());
        out[8..24].copy_from_slice(self.payload_id.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self, TransportError> {
        let mut payload_id = [0u8; PayloadId::LEN];
        payload_id.copy_from_slice(&bytes[8..24]);
        Ok(PacketHeader {
            version: bytes[0],
            kind: PacketKind::try_from(bytes[1])?,
            body_len: u16::from_be_bytes([bytes[2], bytes[3]]),
            seq: u16::from_be_bytes([bytes[4], bytes[5]]),
            total: u16::from_be_bytes([bytes[6], bytes[7]]),
            payload_id: PayloadId(payload_id),
        })
    }
}

/// ワイヤ上のパケット
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Payload の Fragment
    Data(Fragment),
    /// Fragment の受信確認
    Ack { payload_id: PayloadId, seq: u16 },
    /// 生存確認
    Keepalive,
    /// ハンドシェイクメッセージ（protobuf）
    Handshake(Vec<u8>),
    /// 切断通知（protobuf の CloseNotice）
    Close(Vec<u8>),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Data(_) => PacketKind::Data,
            Packet::Ack { .. } => PacketKind::Ack,
            Packet::Keepalive => PacketKind::Keepalive,
            Packet::Handshake(_) => PacketKind::Handshake,
            Packet::Close(_) => PacketKind::Close,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            Packet::Data(frag) => &frag.data,
            Packet::Handshake(body) | Packet::Close(body) => body,
            Packet::Ack { .. } | Packet::Keepalive => &[],
        }
    }

    fn header_fields(&self) -> (u16, u16, PayloadId) {
        match self {
            Packet::Data(frag) => (frag.seq, frag.total, frag.payload_id),
            Packet::Ack { payload_id, seq } => (*seq, 0, *payload_id),
            _ => (0, 0, PayloadId([0u8; PayloadId::LEN])),
        }
    }
}

/// 固定長パケットのコーデック
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        PacketCodec {
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl PacketCodec {
    /// # エラー
    /// - `TransportError::InvalidPacketSize`: `MIN_PACKET_SIZE..=MAX_PACKET_SIZE` の範囲外
    pub fn new(packet_size: usize) -> Result<Self, TransportError> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&packet_size) {
            return Err(TransportError::InvalidPacketSize(packet_size));
        }
        Ok(PacketCodec { packet_size })
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// 1 パケットに載る平文ボディの最大バイト数
    pub fn body_capacity(&self) -> usize {
        self.packet_size - HEADER_LEN - SEAL_OVERHEAD
    }

    /// パケットを `packet_size` バイトにエンコードする
    ///
    /// # エラー
    /// - `TransportError::EncodingTooLarge`: ボディが容量を超える
    /// - `TransportError::Crypto`: 封緘失敗
    pub fn encode<S>(&self, packet: &Packet, sealer: &mut S) -> Result<Vec<u8>, TransportError>
    where
        S: PacketSealer + ?Sized,
    {
        let body = packet.body();
        let capacity = self.body_capacity();
        if body.len() > capacity {
            return Err(TransportError::EncodingTooLarge {
                len: body.len(),
                capacity,
            });
        }

        let (seq, total, payload_id) = packet.header_fields();
        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            kind: packet.kind(),
            body_len: body.len() as u16,
            seq,
            total,
            payload_id,
        }
        .to_bytes();

        let mut plaintext = vec![0u8; capacity];
        plaintext[..body.len()].copy_from_slice(body);
        let sealed = sealer.seal(&header, &plaintext)?;

        let mut out = Vec::with_capacity(self.packet_size);
        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed);
        if out.len() != self.packet_size {
            return Err(TransportError::MalformedPacket(format!(
                "sealed packet is {} bytes, expected {}",
                out.len(),
                self.packet_size
            )));
        }
        Ok(out)
    }

    /// ヘッダーだけを検証して取り出す（ボディには触れない）
    ///
    /// # エラー
    /// - `TransportError::MalformedPacket`: 長さ不一致、未知の種別、body_len が容量超過
    /// - `TransportError::UnsupportedVersion`: バージョン不一致
    pub fn decode_header(&self, bytes: &[u8]) -> Result<PacketHeader, TransportError> {
        if bytes.len() != self.packet_size {
            return Err(TransportError::MalformedPacket(format!(
                "packet is {} bytes, expected {}",
                bytes.len(),
                self.packet_size
            )));
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(TransportError::UnsupportedVersion(bytes[0]));
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = PacketHeader::from_bytes(&raw)?;

        if usize::from(header.body_len) > self.body_capacity() {
            return Err(TransportError::MalformedPacket(format!(
                "body_len {} exceeds capacity {}",
                header.body_len,
                self.body_capacity()
            )));
        }
        Ok(header)
    }

    /// `packet_size` バイトのパケットをデコードする
    ///
    /// 長さ・バージョン・種別を検証してからボディを開く。
    pub fn decode<O>(&self, bytes: &[u8], opener: &mut O) -> Result<Packet, TransportError>
    where
        O: PacketOpener + ?Sized,
    {
        let header = self.decode_header(bytes)?;
        let mut body = opener.open(&bytes[..HEADER_LEN], &bytes[HEADER_LEN..])?;
        body.truncate(usize::from(header.body_len));

        let packet = match header.kind {
            PacketKind::Data => Packet::Data(Fragment {
                payload_id: header.payload_id,
                seq: header.seq,
                total: header.total,
                data: Bytes::from(body),
            }),
            PacketKind::Ack => Packet::Ack {
                payload_id: header.payload_id,
                seq: header.seq,
            },
            PacketKind::Keepalive => Packet::Keepalive,
            PacketKind::Handshake => Packet::Handshake(body),
            PacketKind::Close => Packet::Close(body),
        };
        Ok(packet)
    }
}
