//! ストリーム上の固定長フレームの読み書き

use std::io;

use mix_crypto::PacketSealer;
use mix_transport::{Packet, PacketCodec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SessionError;

/// パケットをエンコードして 1 フレームとして書き込む
pub(crate) async fn write_packet<W, S>(
    writer: &mut W,
    codec: &PacketCodec,
    packet: &Packet,
    sealer: &mut S,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
    S: PacketSealer + ?Sized,
{
    let bytes = codec.encode(packet, sealer)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// `packet_size` バイトを 1 フレームとして読む
///
/// 相手が閉じた場合は `Ok(None)`。
pub(crate) async fn read_frame<R>(reader: &mut R, codec: &PacketCodec) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; codec.packet_size()];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(Some(buf)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}
