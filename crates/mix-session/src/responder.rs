//! ゲートウェイ側のハンドシェイクとフレーミング
//!
//! クライアントの `SessionManager` と対になる実装。ClientHello を受け取り、
//! 鍵を導出して GatewayHello（鍵確認値付き）を返す。確立後は
//! `GatewayLink` でパケットを封緘/開封して送受信する。

use std::sync::Arc;

use mix_crypto::{
    key_confirmation, nonce_from_slice, random_nonce, CryptoSession, Direction, KeyExchange,
    NullCipher, OpeningKey, SealingKey,
};
use mix_proto::{ClientHello, GatewayHello};
use mix_transport::{Packet, PacketCodec};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::frame::{read_frame, write_packet};

/// ゲートウェイ側のハンドシェイク応答器
#[derive(Clone)]
pub struct GatewayResponder {
    kex: Arc<dyn KeyExchange>,
    codec: PacketCodec,
}

impl GatewayResponder {
    pub fn new(kex: Arc<dyn KeyExchange>, codec: PacketCodec) -> Self {
        GatewayResponder { kex, codec }
    }

    /// ClientHello を待って受理し、確立したリンクを返す
    ///
    /// # エラー
    /// - `SessionError::SessionClosed`: Hello の前にクライアントが切断
    /// - `SessionError::Proto`: Hello のデコード失敗・バージョン不一致
    pub async fn accept<S>(&self, stream: S) -> Result<GatewayLink<S>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = split(stream);
        let hello = self.read_client_hello(&mut reader).await?;

        let client_nonce = nonce_from_slice(&hello.client_nonce)?;
        let gateway_nonce = random_nonce()?;
        let key = self.kex.derive(&client_nonce, &gateway_nonce)?;

        let reply = GatewayHello::accept(gateway_nonce.to_vec(), key_confirmation(&key).to_vec());
        write_packet(
            &mut writer,
            &self.codec,
            &Packet::Handshake(reply.encode_to_bytes()),
            &mut NullCipher,
        )
        .await?;

        info!(client_id = %hello.client_id, "gateway accepted session");
        let (seal, open) = CryptoSession::new(&key, Direction::ToClient).split();
        Ok(GatewayLink {
            reader,
            writer,
            seal,
            open,
            codec: self.codec,
            client_id: hello.client_id,
        })
    }

    /// ClientHello を待って拒否を返す
    pub async fn reject<S>(&self, stream: S, reason: &str) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = split(stream);
        let hello = self.read_client_hello(&mut reader).await?;
        warn!(client_id = %hello.client_id, reason, "gateway rejecting session");

        let reply = GatewayHello::reject(reason);
        write_packet(
            &mut writer,
            &self.codec,
            &Packet::Handshake(reply.encode_to_bytes()),
            &mut NullCipher,
        )
        .await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn read_client_hello<R>(&self, reader: &mut R) -> Result<ClientHello, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let bytes = read_frame(reader, &self.codec)
            .await?
            .ok_or(SessionError::SessionClosed)?;
        match self.codec.decode(&bytes, &mut NullCipher)? {
            Packet::Handshake(body) => Ok(ClientHello::decode_from_bytes(&body)?),
            other => Err(SessionError::UnexpectedPacket(other.kind())),
        }
    }
}

/// ゲートウェイ側の確立済みリンク
pub struct GatewayLink<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    seal: SealingKey,
    open: OpeningKey,
    codec: PacketCodec,
    client_id: String,
}

impl<S> GatewayLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// パケットを封緘して送る
    pub async fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        write_packet(&mut self.writer, &self.codec, packet, &mut self.seal).await
    }

    /// エンコード済みのフレームをそのまま書き込む
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 次のパケットを受け取る
    ///
    /// 開封できないフレームは捨てて次を待つ。Keepalive には Keepalive を
    /// 返してから呼び出し側にも渡す。クライアントが閉じたら `Ok(None)`。
    pub async fn receive(&mut self) -> Result<Option<Packet>, SessionError> {
        loop {
            let Some(bytes) = read_frame(&mut self.reader, &self.codec).await? else {
                return Ok(None);
            };
            let packet = match self.codec.decode(&bytes, &mut self.open) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "gateway dropping inbound frame");
                    continue;
                }
            };
            if packet == Packet::Keepalive {
                if let Err(e) = self.send(&Packet::Keepalive).await {
                    debug!(error = %e, "keepalive reply not sent");
                }
            }
            return Ok(Some(packet));
        }
    }

    /// 送信側を閉じる
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
