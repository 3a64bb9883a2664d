//! クライアント側のセッション管理
//!
//! ゲートウェイへの接続、ハンドシェイク、確立後の送受信、生存確認と切断を担当する。
//! `SessionManager` は `Arc` で共有され、送信側と受信側はそれぞれ別のロックで
//! 保護されるので、送信ループと受信ループを並行に回せる。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use mix_crypto::{
    nonce_from_slice, random_nonce, verify_key_confirmation, CryptoSession, Direction,
    KeyExchange, NullCipher, OpeningKey, SealingKey,
};
use mix_proto::{ClientHello, CloseNotice, GatewayHello};
use mix_transport::{Packet, PacketCodec};
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connector::Connector;
use crate::error::SessionError;
use crate::frame::{read_frame, write_packet};
use crate::state::SessionState;

type LinkOf<C> = Link<<C as Connector>::Stream>;

/// 送信側の半分（書き込み + 封緘鍵）
struct Outbound<S> {
    writer: WriteHalf<S>,
    seal: SealingKey,
}

/// 受信側の半分（読み込み + 開封鍵）
struct Inbound<S> {
    reader: ReadHalf<S>,
    open: OpeningKey,
}

/// 確立済みのリンク
struct Link<S> {
    gateway: String,
    outbound: AsyncMutex<Outbound<S>>,
    inbound: AsyncMutex<Inbound<S>>,
    /// 最後に受信できた時刻（ミリ秒）
    last_seen_ms: AtomicU64,
    /// リンク破棄の合図（受信待ちを起こす）
    closed: CancellationToken,
}

/// `connect` が途中で破棄されたときに Handshaking から戻す
struct HandshakeGuard<'a> {
    state: &'a watch::Sender<SessionState>,
    armed: bool,
}

impl HandshakeGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.state.send_if_modified(|state| {
            if *state == SessionState::Handshaking {
                *state = SessionState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

/// ゲートウェイとのセッション管理
pub struct SessionManager<C: Connector> {
    connector: C,
    kex: Arc<dyn KeyExchange>,
    config: SessionConfig,
    codec: PacketCodec,
    state: watch::Sender<SessionState>,
    link: Mutex<Option<Arc<LinkOf<C>>>>,
    started: Instant,
}

impl<C: Connector> SessionManager<C> {
    /// # エラー
    /// - `SessionError::Transport`: `config.packet_size` が範囲外
    pub fn new(
        connector: C,
        kex: Arc<dyn KeyExchange>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let codec = PacketCodec::new(config.packet_size)?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        Ok(SessionManager {
            connector,
            kex,
            config,
            codec,
            state,
            link: Mutex::new(None),
            started: Instant::now(),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 状態の変化を購読する
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    /// 接続中のゲートウェイのアドレス
    pub fn gateway(&self) -> Option<String> {
        self.current_link().map(|link| link.gateway.clone())
    }

    /// セッション開始からの経過ミリ秒
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// ゲートウェイに接続してハンドシェイクする
    ///
    /// 一時的な失敗（タイムアウト・I/O）は `handshake_retries` 回まで
    /// `backoff_base * 2^n` 待って再試行する。途中で future が破棄されたら
    /// `Disconnected` に戻る。
    ///
    /// # エラー
    /// - `SessionError::InvalidState`: `Disconnected` 以外から呼ばれた
    /// - `SessionError::HandshakeFailed`: すべての試行が失敗、または再試行しても無駄な失敗
    pub async fn connect(&self, gateway: &str) -> Result<(), SessionError> {
        let mut entered = false;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                *state = SessionState::Handshaking;
                entered = true;
            }
            entered
        });
        if !entered {
            return Err(SessionError::InvalidState(self.state()));
        }
        let guard = HandshakeGuard {
            state: &self.state,
            armed: true,
        };

        let mut attempt: u32 = 0;
        loop {
            debug!(gateway, attempt, "handshake attempt");
            let result = match timeout(self.config.handshake_timeout, self.handshake(gateway)).await
            {
                Ok(result) => result,
                Err(_) => Err(SessionError::HandshakeTimeout),
            };

            let err = match result {
                Ok(link) => {
                    *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(link));
                    self.state.send_replace(SessionState::Established);
                    guard.disarm();
                    info!(gateway, "session established");
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.config.handshake_retries {
                warn!(gateway, attempts = attempt + 1, error = %err, "handshake failed");
                drop(guard);
                return Err(SessionError::HandshakeFailed {
                    attempts: attempt + 1,
                    reason: err.to_string(),
                });
            }

            let delay = self.config.backoff_for(attempt);
            warn!(gateway, attempt, error = %err, ?delay, "handshake attempt failed, retrying");
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// 1 回分のハンドシェイク
    async fn handshake(&self, gateway: &str) -> Result<LinkOf<C>, SessionError> {
        let stream = self.connector.connect(gateway).await?;
        let (mut reader, mut writer) = split(stream);

        let client_nonce = random_nonce()?;
        let hello = ClientHello::new(client_nonce.to_vec(), self.config.client_id.clone());
        write_packet(
            &mut writer,
            &self.codec,
            &Packet::Handshake(hello.encode_to_bytes()),
            &mut NullCipher,
        )
        .await?;

        let bytes = read_frame(&mut reader, &self.codec)
            .await?
            .ok_or(SessionError::SessionClosed)?;
        let reply = match self.codec.decode(&bytes, &mut NullCipher)? {
            Packet::Handshake(body) => GatewayHello::decode_from_bytes(&body)?,
            other => return Err(SessionError::UnexpectedPacket(other.kind())),
        };
        if let Some(reason) = reply.reject_reason {
            return Err(SessionError::HandshakeRejected(reason));
        }

        let gateway_nonce = nonce_from_slice(&reply.gateway_nonce)?;
        let key = self.kex.derive(&client_nonce, &gateway_nonce)?;
        if !verify_key_confirmation(&key, &reply.key_confirmation) {
            return Err(SessionError::KeyConfirmationFailed);
        }

        let (seal, open) = CryptoSession::new(&key, Direction::ToGateway).split();
        Ok(Link {
            gateway: gateway.to_string(),
            outbound: AsyncMutex::new(Outbound { writer, seal }),
            inbound: AsyncMutex::new(Inbound { reader, open }),
            last_seen_ms: AtomicU64::new(self.now_ms()),
            closed: CancellationToken::new(),
        })
    }

    /// パケットを封緘して送る
    ///
    /// 1 フレームを書き終えるまで送信側のロックを保持する。
    /// `Draining` 中も送れる（残りの送信を流し切るため）。
    ///
    /// # エラー
    /// - `SessionError::NotConnected`: `Established` / `Draining` 以外
    /// - `SessionError::SessionClosed`: 書き込み中にリンクが壊れた
    pub async fn send(&self, packet: &Packet) -> Result<(), SessionError> {
        if !matches!(
            self.state(),
            SessionState::Established | SessionState::Draining
        ) {
            return Err(SessionError::NotConnected);
        }
        let link = self.current_link().ok_or(SessionError::NotConnected)?;

        let mut out = link.outbound.lock().await;
        let Outbound { writer, seal } = &mut *out;
        let result = write_packet(writer, &self.codec, packet, seal).await;
        match result {
            Ok(()) => Ok(()),
            Err(SessionError::Io(e)) => {
                warn!(error = %e, "write failed, closing session");
                drop(out);
                self.drop_link(&link);
                Err(SessionError::SessionClosed)
            }
            Err(e) => Err(e),
        }
    }

    /// 生存確認を送る
    ///
    /// ゲートウェイは Keepalive に Keepalive を返すので、静かなセッションでも
    /// `check_idle` の受信時刻が更新される。
    pub async fn keepalive(&self) -> Result<(), SessionError> {
        self.send(&Packet::Keepalive).await
    }

    /// 次の受信パケットを待つ
    ///
    /// 壊れた・開封できない・リプレイされたフレームは捨ててログに残す。
    /// Keepalive は生存時刻を更新するだけで返さない。
    ///
    /// # エラー
    /// - `SessionError::NotConnected`: リンクがない
    /// - `SessionError::SessionClosed`: ゲートウェイの Close、EOF、またはリンク破棄
    pub async fn receive(&self) -> Result<Packet, SessionError> {
        let link = self.current_link().ok_or(SessionError::NotConnected)?;
        let mut inbound = link.inbound.lock().await;
        let Inbound { reader, open } = &mut *inbound;

        loop {
            let frame = tokio::select! {
                _ = link.closed.cancelled() => return Err(SessionError::SessionClosed),
                frame = read_frame(reader, &self.codec) => frame,
            };

            let bytes = match frame {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    info!(gateway = %link.gateway, "gateway closed the stream");
                    self.drop_link(&link);
                    return Err(SessionError::SessionClosed);
                }
                Err(e) => {
                    warn!(gateway = %link.gateway, error = %e, "read failed, closing session");
                    self.drop_link(&link);
                    return Err(SessionError::SessionClosed);
                }
            };

            let packet = match self.codec.decode(&bytes, open) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(error = %e, "dropping inbound packet");
                    continue;
                }
            };
            link.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);

            match packet {
                Packet::Keepalive => continue,
                Packet::Handshake(_) => {
                    warn!("dropping handshake packet on established session");
                    continue;
                }
                Packet::Close(body) => {
                    let reason = CloseNotice::decode_from_bytes(&body)
                        .map(|notice| notice.reason)
                        .unwrap_or_default();
                    info!(gateway = %link.gateway, reason, "gateway closed the session");
                    self.drop_link(&link);
                    return Err(SessionError::SessionClosed);
                }
                packet @ (Packet::Data(_) | Packet::Ack { .. }) => return Ok(packet),
            }
        }
    }

    /// 受信が `idle_timeout` 以上途絶えていればリンクを切る
    ///
    /// 切った場合は `true`。受信待ちは `SessionClosed` で起こされる。
    pub fn check_idle(&self) -> bool {
        if self.state() != SessionState::Established {
            return false;
        }
        let Some(link) = self.current_link() else {
            return false;
        };
        let idle_ms = self
            .now_ms()
            .saturating_sub(link.last_seen_ms.load(Ordering::Relaxed));
        if idle_ms < self.config.idle_timeout.as_millis() as u64 {
            return false;
        }
        warn!(gateway = %link.gateway, idle_ms, "gateway idle, dropping session");
        self.drop_link(&link);
        true
    }

    /// `Established` から `Draining` に移る
    ///
    /// 以後も `send` は通るが、`check_idle` と再接続の対象から外れる。
    /// 移った場合は `true`。
    pub fn begin_drain(&self) -> bool {
        let drained = self.state.send_if_modified(|state| {
            if *state == SessionState::Established {
                *state = SessionState::Draining;
                true
            } else {
                false
            }
        });
        if drained {
            debug!("session draining");
        }
        drained
    }

    /// セッションを閉じる（何度呼んでもよい）
    ///
    /// `Draining` に移り、書き込み中のフレームを待ってから Close を送り、
    /// ストリームを閉じる。
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let Some(link) = self.current_link() else {
            self.state.send_replace(SessionState::Disconnected);
            return Ok(());
        };
        self.state.send_replace(SessionState::Draining);

        {
            let mut out = link.outbound.lock().await;
            let Outbound { writer, seal } = &mut *out;
            let close = Packet::Close(CloseNotice::new("client disconnect").encode_to_bytes());
            if let Err(e) = write_packet(writer, &self.codec, &close, seal).await {
                debug!(error = %e, "close notice not delivered");
            }
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "shutdown failed");
            }
        }

        self.drop_link(&link);
        info!(gateway = %link.gateway, "session disconnected");
        Ok(())
    }

    fn current_link(&self) -> Option<Arc<LinkOf<C>>> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `link` がまだ現在のリンクなら外して Disconnected にする
    fn drop_link(&self, link: &Arc<LinkOf<C>>) {
        link.closed.cancel();
        let mut current = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|l| Arc::ptr_eq(l, link)) {
            *current = None;
            drop(current);
            self.state.send_replace(SessionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use mix_crypto::PresharedKeyExchange;
    use mix_transport::{Fragment, PayloadId};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;

    use crate::responder::{GatewayLink, GatewayResponder};

    const PSK: [u8; 16] = [0x11; 16];
    const PACKET_SIZE: usize = 512;

    fn test_config() -> SessionConfig {
        SessionConfig {
            packet_size: PACKET_SIZE,
            ..SessionConfig::default()
        }
    }

    /// 接続ごとに duplex を作り、相手側をチャネルで渡す
    struct DuplexConnector {
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _gateway: &str) -> io::Result<DuplexStream> {
            let (client, gateway) = duplex(64 * 1024);
            self.peers
                .send(gateway)
                .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
            Ok(client)
        }
    }

    /// 常に接続を拒否し、試行時刻を記録する
    struct RefusingConnector {
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _gateway: &str) -> io::Result<DuplexStream> {
            self.attempts.lock().unwrap().push(Instant::now());
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    fn responder(psk: [u8; 16]) -> GatewayResponder {
        GatewayResponder::new(
            Arc::new(PresharedKeyExchange::new(psk)),
            PacketCodec::new(PACKET_SIZE).unwrap(),
        )
    }

    fn manager(
        config: SessionConfig,
    ) -> (SessionManager<DuplexConnector>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(
            DuplexConnector { peers: tx },
            Arc::new(PresharedKeyExchange::new(PSK)),
            config,
        )
        .unwrap();
        (manager, rx)
    }

    async fn established() -> (SessionManager<DuplexConnector>, GatewayLink<DuplexStream>) {
        let (manager, mut peers) = manager(test_config());
        let gateway = tokio::spawn(async move {
            let stream = peers.recv().await.unwrap();
            responder(PSK).accept(stream).await.unwrap()
        });
        manager.connect("gateway").await.unwrap();
        (manager, gateway.await.unwrap())
    }

    fn data(seq: u16) -> Packet {
        Packet::Data(Fragment {
            payload_id: PayloadId([5u8; 16]),
            seq,
            total: 4,
            data: Bytes::from_static(b"hello"),
        })
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let (manager, mut gateway) = established().await;
        assert_eq!(manager.state(), SessionState::Established);
        assert_eq!(manager.gateway().as_deref(), Some("gateway"));
        assert_eq!(gateway.client_id(), "mix-client");

        manager.send(&data(0)).await.unwrap();
        assert_eq!(gateway.receive().await.unwrap(), Some(data(0)));

        let ack = Packet::Ack {
            payload_id: PayloadId([5u8; 16]),
            seq: 0,
        };
        gateway.send(&Packet::Keepalive).await.unwrap();
        gateway.send(&ack).await.unwrap();
        // Keepalive は返らない
        assert_eq!(manager.receive().await.unwrap(), ack);
    }

    #[tokio::test]
    async fn test_send_requires_established() {
        let (manager, _peers) = manager(test_config());
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(matches!(
            manager.send(&Packet::Keepalive).await,
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(manager.receive().await, Err(SessionError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_retries_with_backoff() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let config = SessionConfig {
            handshake_retries: 3,
            backoff_base: Duration::from_millis(100),
            ..test_config()
        };
        let manager = SessionManager::new(
            RefusingConnector {
                attempts: attempts.clone(),
            },
            Arc::new(PresharedKeyExchange::new(PSK)),
            config,
        )
        .unwrap();

        let err = manager.connect("gateway").await.unwrap_err();
        assert!(
            matches!(err, SessionError::HandshakeFailed { attempts: 4, .. }),
            "初回 + 3 回の再試行のあとで失敗: {:?}",
            err
        );
        assert_eq!(manager.state(), SessionState::Disconnected);

        let times = attempts.lock().unwrap().clone();
        assert_eq!(times.len(), 4);
        for (i, expected) in [100u64, 200, 400].into_iter().enumerate() {
            let gap = times[i + 1] - times[i];
            assert!(
                gap >= Duration::from_millis(expected) && gap < Duration::from_millis(expected + 5),
                "{} 回目の待ち時間が {:?}",
                i,
                gap
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_gateway_times_out_and_retries() {
        let config = SessionConfig {
            handshake_timeout: Duration::from_millis(500),
            handshake_retries: 1,
            ..test_config()
        };
        let (manager, mut peers) = manager(config);
        // 接続を受けるだけで応答しない
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(stream) = peers.recv().await {
                held.push(stream);
            }
        });

        let err = manager.connect("gateway").await.unwrap_err();
        match err {
            SessionError::HandshakeFailed { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("timed out"), "reason: {}", reason);
            }
            other => panic!("想定外のエラー: {:?}", other),
        }
        drop(manager);
        hold.await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_not_retried() {
        let (manager, mut peers) = manager(test_config());
        let gateway = tokio::spawn(async move {
            let mut stream = peers.recv().await.unwrap();
            let mut hello = vec![0u8; PACKET_SIZE];
            stream.read_exact(&mut hello).await.unwrap();
            // 未知のバージョンのパケットを返す
            let codec = PacketCodec::new(PACKET_SIZE).unwrap();
            let mut reply = codec.encode(&Packet::Handshake(vec![]), &mut NullCipher).unwrap();
            reply[0] = 9;
            stream.write_all(&reply).await.unwrap();
            stream
        });

        let err = manager.connect("gateway").await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeFailed { attempts: 1, .. }));
        let _stream = gateway.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let (manager, mut peers) = manager(test_config());
        tokio::spawn(async move {
            let stream = peers.recv().await.unwrap();
            responder(PSK).reject(stream, "gateway full").await.unwrap();
        });

        match manager.connect("gateway").await.unwrap_err() {
            SessionError::HandshakeFailed { attempts, reason } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("gateway full"));
            }
            other => panic!("想定外のエラー: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_psk_fails_confirmation() {
        let (manager, mut peers) = manager(test_config());
        tokio::spawn(async move {
            let stream = peers.recv().await.unwrap();
            let _ = responder([0x22; 16]).accept(stream).await;
        });

        match manager.connect("gateway").await.unwrap_err() {
            SessionError::HandshakeFailed { attempts, reason } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("Key confirmation"));
            }
            other => panic!("想定外のエラー: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid() {
        let (manager, _gateway) = established().await;
        assert!(matches!(
            manager.connect("gateway").await,
            Err(SessionError::InvalidState(SessionState::Established))
        ));
    }

    #[tokio::test]
    async fn test_gateway_close_ends_session() {
        let (manager, mut gateway) = established().await;
        gateway
            .send(&Packet::Close(CloseNotice::new("maintenance").encode_to_bytes()))
            .await
            .unwrap();

        assert!(matches!(manager.receive().await, Err(SessionError::SessionClosed)));
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(matches!(
            manager.send(&Packet::Keepalive).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_eof_ends_session() {
        let (manager, gateway) = established().await;
        drop(gateway);
        assert!(matches!(manager.receive().await, Err(SessionError::SessionClosed)));
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_sends_close_and_is_idempotent() {
        let (manager, mut gateway) = established().await;
        let mut states = manager.subscribe_state();

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(states.has_changed().unwrap());

        match gateway.receive().await.unwrap() {
            Some(Packet::Close(body)) => {
                assert_eq!(CloseNotice::decode_from_bytes(&body).unwrap().reason, "client disconnect");
            }
            other => panic!("Close を期待: {:?}", other),
        }
        assert_eq!(gateway.receive().await.unwrap(), None);

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_wakes_receiver() {
        let (manager, _gateway) = established().await;
        let manager = Arc::new(manager);
        let receiver = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.receive().await })
        };
        tokio::task::yield_now().await;

        manager.disconnect().await.unwrap();
        assert!(matches!(receiver.await.unwrap(), Err(SessionError::SessionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_returns_to_disconnected() {
        let (manager, mut peers) = manager(test_config());
        let gateway = tokio::spawn(async move {
            // 1 本目は応答しない
            let silent = peers.recv().await.unwrap();
            let stream = peers.recv().await.unwrap();
            let link = responder(PSK).accept(stream).await.unwrap();
            (silent, link)
        });

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), manager.connect("gateway")).await;
        assert!(cancelled.is_err());
        assert_eq!(manager.state(), SessionState::Disconnected);

        manager.connect("gateway").await.unwrap();
        assert_eq!(manager.state(), SessionState::Established);
        let _ = gateway.await.unwrap();
    }

    #[tokio::test]
    async fn test_draining_still_sends() {
        let (manager, mut gateway) = established().await;
        assert!(manager.begin_drain());
        assert_eq!(manager.state(), SessionState::Draining);
        assert!(!manager.begin_drain());
        assert!(!manager.check_idle());

        manager.send(&data(2)).await.unwrap();
        assert_eq!(gateway.receive().await.unwrap(), Some(data(2)));

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(matches!(gateway.receive().await.unwrap(), Some(Packet::Close(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_echo_keeps_session_alive() {
        let config = SessionConfig {
            idle_timeout: Duration::from_secs(10),
            ..test_config()
        };
        let (manager, mut peers) = manager(config);
        let gateway = tokio::spawn(async move {
            let stream = peers.recv().await.unwrap();
            let mut link = responder(PSK).accept(stream).await.unwrap();
            let mut keepalives = 0u32;
            while let Ok(Some(packet)) = link.receive().await {
                if packet == Packet::Keepalive {
                    keepalives += 1;
                }
            }
            keepalives
        });
        manager.connect("gateway").await.unwrap();
        let manager = Arc::new(manager);
        let receiver = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.receive().await })
        };

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            manager.keepalive().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!manager.check_idle(), "Keepalive の応答で生存時刻が更新される");
        }
        assert_eq!(manager.state(), SessionState::Established);

        manager.disconnect().await.unwrap();
        assert!(matches!(receiver.await.unwrap(), Err(SessionError::SessionClosed)));
        assert_eq!(gateway.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_corrupt_frames_are_dropped() {
        let (manager, mut peers) = manager(test_config());
        let gateway = tokio::spawn(async move {
            let stream = peers.recv().await.unwrap();
            responder(PSK).accept(stream).await.unwrap()
        });
        manager.connect("gateway").await.unwrap();
        let mut gateway = gateway.await.unwrap();

        // 鍵なしで封緘したパケット（開封できない）のあとに正しいパケット
        let codec = PacketCodec::new(PACKET_SIZE).unwrap();
        let plain = codec.encode(&data(0), &mut NullCipher).unwrap();
        gateway.send_frame(&plain).await.unwrap();
        gateway.send(&data(1)).await.unwrap();
        assert_eq!(manager.receive().await.unwrap(), data(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_link_is_dropped() {
        let config = SessionConfig {
            idle_timeout: Duration::from_secs(10),
            ..test_config()
        };
        let (manager, mut peers) = manager(config);
        let gateway = tokio::spawn(async move {
            let stream = peers.recv().await.unwrap();
            responder(PSK).accept(stream).await.unwrap()
        });
        manager.connect("gateway").await.unwrap();
        let _gateway = gateway.await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!manager.check_idle());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.check_idle());
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(matches!(manager.receive().await, Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_counter_shared_across_tasks() {
        let (manager, mut gateway) = established().await;
        let manager = Arc::new(manager);
        let sent = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for seq in 0..4u16 {
            let manager = manager.clone();
            let sent = sent.clone();
            tasks.push(tokio::spawn(async move {
                manager.send(&data(seq)).await.unwrap();
                sent.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(sent.load(Ordering::SeqCst), 4);

        // 4 フレームとも開封できる（nonce の重複なし）
        let mut seqs = Vec::new();
        for _ in 0..4 {
            match gateway.receive().await.unwrap() {
                Some(Packet::Data(frag)) => seqs.push(frag.seq),
                other => panic!("Data を期待: {:?}", other),
            }
        }
        seqs.sort();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }
}
