//! MixnetClient: アプリケーションから使う公開 API
//!
//! ## 構成
//!
//! ```text
//! MixnetClient
//!   ├── SessionManager (mix-session)  - ゲートウェイとの暗号化セッション
//!   ├── Dispatcher     (mix-dispatch) - in-flight 上限・ACK 待ち・受信振り分け
//!   ├── Fragmenter     (mix-transport) - Payload を Fragment に分割
//!   └── ワーカー
//!         ├── 受信ループ: receive → on_receive → ACK 返送・コールバック・再接続
//!         ├── 送信ループ: 送信キュー → send
//!         └── タイマー: Keepalive・期限切れ掃除・生存確認
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use mix_crypto::PresharedKeyExchange;
use mix_dispatch::{DeliveryHandle, DispatchError, Dispatcher, OutboundQueue, ReceivedMessage};
use mix_session::{Connector, SessionError, SessionManager, SessionState, TcpConnector};
use mix_transport::{Fragmenter, Packet};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;

/// 受信メッセージのコールバック
pub type MessageCallback = Arc<dyn Fn(&ReceivedMessage) + Send + Sync>;

/// クライアントの統計情報（JSON に変換できる）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub state: String,
    pub gateway: Option<String>,
    pub payloads_sent: u64,
    pub bytes_sent: u64,
    pub payloads_received: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
    pub reconnects: u64,
    pub in_flight: usize,
    pub acknowledged: u64,
    pub ack_timeouts: u64,
    pub unmatched: u64,
    pub pending_reassembly: usize,
    pub reassembly_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    payloads_sent: AtomicU64,
    bytes_sent: AtomicU64,
    payloads_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_dropped: AtomicU64,
    reconnects: AtomicU64,
}

/// ワーカーと共有する状態
struct Shared<C: Connector> {
    config: ClientConfig,
    session: SessionManager<C>,
    dispatcher: Dispatcher,
    fragmenter: Fragmenter,
    callbacks: RwLock<Vec<MessageCallback>>,
    counters: Counters,
    /// 切断開始（新しい送信と再接続をやめ、送信キューを流し切る）
    closing: CancellationToken,
    /// ワーカー停止
    shutdown: CancellationToken,
}

struct Workers {
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
    timer: JoinHandle<()>,
}

/// ミックスネットのクライアント
pub struct MixnetClient<C: Connector = TcpConnector> {
    shared: Arc<Shared<C>>,
    /// `disconnect` の間ロックしたままにする（同時に呼ばれても 1 回ずつ）
    workers: AsyncMutex<Option<Workers>>,
}

impl MixnetClient<TcpConnector> {
    /// TCP でゲートウェイに接続する
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        Self::connect_with(config, TcpConnector).await
    }
}

impl<C: Connector> MixnetClient<C> {
    /// 指定した `Connector` でゲートウェイに接続し、ワーカーを起動する
    ///
    /// # エラー
    /// - `ClientError::Config` / `ClientError::Crypto`: 設定が不正
    /// - `ClientError::Session`: ハンドシェイク失敗（`HandshakeFailed`）
    pub async fn connect_with(config: ClientConfig, connector: C) -> Result<Self, ClientError> {
        config.validate()?;
        let kex = Arc::new(PresharedKeyExchange::new(config.psk_bytes()?));
        let session = SessionManager::new(connector, kex, config.session_config())?;
        let (dispatcher, queue) = Dispatcher::new(config.dispatcher_config());
        let fragmenter = Fragmenter::new(session.codec().body_capacity());

        session.connect(&config.gateway).await?;

        let shared = Arc::new(Shared {
            config,
            session,
            dispatcher,
            fragmenter,
            callbacks: RwLock::new(Vec::new()),
            counters: Counters::default(),
            closing: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        });

        let workers = Workers {
            inbound: tokio::spawn(inbound_loop(shared.clone())),
            outbound: tokio::spawn(outbound_loop(shared.clone(), queue)),
            timer: tokio::spawn(timer_loop(shared.clone())),
        };

        Ok(MixnetClient {
            shared,
            workers: AsyncMutex::new(Some(workers)),
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.session.state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Payload を送る
    ///
    /// セッションが確立していなければ `connect_timeout` まで待つ。
    /// in-flight が上限なら枠が空くまで待つ。
    ///
    /// # 戻り値
    /// 全 Fragment の ACK を待てる `DeliveryHandle`
    ///
    /// # エラー
    /// - `ClientError::NotConnected`: 確立を待ちきれなかった、または切断済み
    /// - `ClientError::Transport`: Payload が大きすぎる
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<DeliveryHandle, ClientError> {
        self.wait_established().await?;

        let payload: Bytes = payload.into();
        let len = payload.len() as u64;
        let (payload_id, fragments) = self.shared.fragmenter.fragment(payload)?;

        let mut acks = Vec::with_capacity(fragments.len());
        for frag in fragments {
            let now_ms = self.shared.session.now_ms();
            let ack = self
                .shared
                .dispatcher
                .submit(Packet::Data(frag), now_ms)
                .await
                .map_err(|e| match e {
                    DispatchError::SessionClosed => ClientError::NotConnected,
                    other => other.into(),
                })?;
            acks.push(ack);
        }

        let counters = &self.shared.counters;
        counters.payloads_sent.fetch_add(1, Ordering::Relaxed);
        counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        debug!(payload_id = %payload_id, fragments = acks.len(), "payload queued");
        Ok(DeliveryHandle::new(payload_id, acks))
    }

    async fn wait_established(&self) -> Result<(), ClientError> {
        if self.shared.closing.is_cancelled() || !self.shared.dispatcher.is_accepting() {
            return Err(ClientError::NotConnected);
        }
        let mut states = self.shared.session.subscribe_state();
        let established = timeout(
            self.shared.config.connect_timeout(),
            wait_for_established(&mut states),
        )
        .await;
        match established {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(ClientError::NotConnected),
        }
    }

    /// 受信メッセージのコールバックを登録する
    ///
    /// コールバックは受信ループの中で呼ばれるので、重い処理はしないこと。
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// 受信メッセージをチャネルで受け取る
    ///
    /// 受け手が追いつかずチャネルが満杯のときは、そのメッセージを捨てる。
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<ReceivedMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.on_message(move |message| {
            if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(message.clone()) {
                warn!(payload_id = %dropped.payload_id, "subscriber lagging, message dropped");
            }
        });
        rx
    }

    pub fn stats(&self) -> ClientStats {
        let counters = &self.shared.counters;
        let dispatch = self.shared.dispatcher.stats();
        ClientStats {
            state: self.state().to_string(),
            gateway: self.shared.session.gateway(),
            payloads_sent: counters.payloads_sent.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            payloads_received: counters.payloads_received.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            packets_dropped: counters.packets_dropped.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            in_flight: dispatch.in_flight,
            acknowledged: dispatch.acknowledged,
            ack_timeouts: dispatch.ack_timeouts,
            unmatched: dispatch.unmatched,
            pending_reassembly: dispatch.pending_reassembly,
            reassembly_timeouts: dispatch.reassembly_timeouts,
        }
    }

    /// 統計情報を JSON 文字列で返す
    ///
    /// ```json
    /// {"state":"established","gateway":"127.0.0.1:1789","payloads_sent":3, ...}
    /// ```
    pub fn stats_json(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(&self.stats())?)
    }

    /// 切断する（何度呼んでもよい）
    ///
    /// 1. 新しい送信を止め、セッションを `Draining` にする
    /// 2. 送信ループが積まれたパケットを送り切るのを待つ
    /// 3. ゲートウェイに Close を送り、ワーカーを止め、ACK 待ちを `SessionClosed` で失敗させる
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let mut guard = self.workers.lock().await;

        self.shared.closing.cancel();
        self.shared.dispatcher.stop_accepting();
        self.shared.session.begin_drain();

        let mut remaining = Vec::new();
        if let Some(Workers {
            inbound,
            outbound,
            timer,
        }) = guard.take()
        {
            join_worker(outbound).await;
            remaining.push(inbound);
            remaining.push(timer);
        }

        let result = self.shared.session.disconnect().await;
        self.shared.shutdown.cancel();
        self.shared.dispatcher.close();
        for task in remaining {
            join_worker(task).await;
        }
        result?;
        info!("client disconnected");
        Ok(())
    }
}

impl<C: Connector> Drop for MixnetClient<C> {
    fn drop(&mut self) {
        self.shared.closing.cancel();
        self.shared.shutdown.cancel();
        self.shared.dispatcher.close();
    }
}

async fn join_worker(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!(error = %e, "worker task failed");
    }
}

/// `Established` になるまで待つ。状態の送り手がなくなったら `false`。
async fn wait_for_established(states: &mut watch::Receiver<SessionState>) -> bool {
    let result = states.wait_for(|s| *s == SessionState::Established).await;
    result.is_ok()
}

/// 受信ループ
async fn inbound_loop<C: Connector>(shared: Arc<Shared<C>>) {
    loop {
        let received = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            received = shared.session.receive() => received,
        };

        match received {
            Ok(packet) => handle_inbound(&shared, packet).await,
            Err(SessionError::SessionClosed | SessionError::NotConnected) => {
                if shared.closing.is_cancelled() {
                    break;
                }
                if !shared.config.reconnect {
                    warn!("session closed, reconnect disabled");
                    shared.dispatcher.close();
                    break;
                }
                if !reconnect(&shared).await {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                shared.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!("inbound loop stopped");
}

async fn handle_inbound<C: Connector>(shared: &Shared<C>, packet: Packet) {
    let now_ms = shared.session.now_ms();
    let inbound = match shared.dispatcher.on_receive(packet, now_ms) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(error = %e, "dropping inbound packet");
            shared.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // ACK は送信キューを通さずに返す（in-flight 枠を待つと相手と詰まる）
    if let Some(ack) = inbound.ack {
        if let Err(e) = shared.session.send(&ack).await {
            debug!(error = %e, "ack not sent");
        }
    }

    if let Some(message) = inbound.message {
        let counters = &shared.counters;
        counters.payloads_received.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes_received
            .fetch_add(message.payload.len() as u64, Ordering::Relaxed);

        let callbacks: Vec<MessageCallback> = shared
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(&message);
        }
    }
}

/// 再接続できるまで繰り返す。停止したら `false`。
async fn reconnect<C: Connector>(shared: &Shared<C>) -> bool {
    let gateway = shared.config.gateway.as_str();
    loop {
        info!(gateway, "reconnecting");
        let result = tokio::select! {
            _ = shared.closing.cancelled() => return false,
            result = shared.session.connect(gateway) => result,
        };
        match result {
            Ok(()) => {
                shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(gateway, "reconnected");
                return true;
            }
            Err(SessionError::InvalidState(state)) => {
                debug!(%state, "reconnect skipped");
                return !shared.closing.is_cancelled();
            }
            Err(e) => {
                warn!(gateway, error = %e, "reconnect failed");
                tokio::select! {
                    _ = shared.closing.cancelled() => return false,
                    _ = sleep(shared.session.config().backoff_max) => {}
                }
            }
        }
    }
}

/// 送信ループ
///
/// 切断中のパケットは確立を待ってから送る。切断が始まったら
/// キューに残ったパケットを送り切って終わる。
async fn outbound_loop<C: Connector>(shared: Arc<Shared<C>>, mut queue: OutboundQueue) {
    let mut states = shared.session.subscribe_state();
    loop {
        let packet = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = shared.closing.cancelled() => {
                flush_queue(&shared, &mut queue).await;
                break;
            }
            packet = queue.next() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        if !send_when_established(&shared, &mut states, &packet).await {
            break;
        }
    }
    debug!("outbound loop stopped");
}

/// 1 パケットを送る。確立していなければ確立を待つ。
///
/// 確立を待つ間に切断が始まったら `false`。
async fn send_when_established<C: Connector>(
    shared: &Shared<C>,
    states: &mut watch::Receiver<SessionState>,
    packet: &Packet,
) -> bool {
    loop {
        match shared.session.send(packet).await {
            Ok(()) => return true,
            Err(SessionError::NotConnected | SessionError::SessionClosed) => {
                let established = tokio::select! {
                    _ = shared.closing.cancelled() => false,
                    _ = shared.shutdown.cancelled() => false,
                    established = wait_for_established(states) => established,
                };
                if !established {
                    debug!(kind = ?packet.kind(), "packet not sent, client closing");
                    return false;
                }
            }
            Err(e) => {
                warn!(error = %e, kind = ?packet.kind(), "packet dropped");
                shared.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
    }
}

/// キューに残ったパケットを順に送り切る
async fn flush_queue<C: Connector>(shared: &Shared<C>, queue: &mut OutboundQueue) {
    let mut flushed = 0usize;
    while let Some(packet) = queue.try_next() {
        if let Err(e) = shared.session.send(&packet).await {
            warn!(error = %e, flushed, "flush stopped");
            break;
        }
        flushed += 1;
    }
    debug!(flushed, "outbound queue flushed");
}

/// Keepalive・期限切れ掃除・生存確認のタイマー
async fn timer_loop<C: Connector>(shared: Arc<Shared<C>>) {
    let mut keepalive = interval(shared.config.keepalive_interval());
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = interval(shared.config.sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval の初回は即時
    keepalive.tick().await;
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = keepalive.tick() => {
                if shared.session.state() == SessionState::Established {
                    if let Err(e) = shared.session.keepalive().await {
                        debug!(error = %e, "keepalive not sent");
                    }
                }
            }
            _ = sweep.tick() => {
                let now_ms = shared.session.now_ms();
                let expired = shared.dispatcher.expire(now_ms);
                if expired > 0 {
                    warn!(expired, "acknowledgements timed out");
                }
                shared.session.check_idle();
            }
        }
    }
    debug!("timer loop stopped");
}
