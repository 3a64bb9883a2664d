//! クライアント設定
//!
//! JSON から読み込める。省略したフィールドは既定値になる。
//!
//! ```json
//! {
//!   "gateway": "gateway.example.net:1789",
//!   "psk": "4NeCCgvZFe2RnPgrcU1PQw",
//!   "max_in_flight": 32,
//!   "keepalive_interval_ms": 5000
//! }
//! ```

use std::time::Duration;

use mix_crypto::decode_base64_key;
use mix_dispatch::{
    DispatcherConfig, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_REASSEMBLY_TIMEOUT_MS,
};
use mix_session::{
    SessionConfig, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_HANDSHAKE_RETRIES,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_IDLE_TIMEOUT_MS,
};
use mix_transport::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use serde::Deserialize;

use crate::error::ClientError;
use crate::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_SWEEP_INTERVAL_MS};

/// クライアント設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// ゲートウェイのアドレス（`host:port`）
    pub gateway: String,
    /// 事前共有鍵（Base64 22文字, URL-safe no-pad）
    pub psk: String,
    /// ハンドシェイクで名乗る識別子
    pub client_id: String,
    pub packet_size: usize,
    pub max_in_flight: usize,
    pub ack_timeout_ms: u64,
    pub reassembly_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    /// `send` がセッション確立を待つ上限
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub handshake_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub idle_timeout_ms: u64,
    /// 期限切れの確認間隔
    pub sweep_interval_ms: u64,
    /// 予期しない切断のあとに自動で再接続する
    pub reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            gateway: String::new(),
            psk: String::new(),
            client_id: String::from("mix-client"),
            packet_size: DEFAULT_PACKET_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            reassembly_timeout_ms: DEFAULT_REASSEMBLY_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            handshake_retries: DEFAULT_HANDSHAKE_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            reconnect: true,
        }
    }
}

impl ClientConfig {
    pub fn new(gateway: impl Into<String>, psk: impl Into<String>) -> Self {
        ClientConfig {
            gateway: gateway.into(),
            psk: psk.into(),
            ..ClientConfig::default()
        }
    }

    /// JSON 文字列から読み込み、検証する
    ///
    /// # エラー
    /// - `ClientError::Json`: JSON として不正
    /// - `ClientError::Config` / `ClientError::Crypto`: 値が不正
    pub fn from_json(json: &str) -> Result<Self, ClientError> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 値の整合性を確認する
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.gateway.trim().is_empty() {
            return Err(ClientError::Config("gateway must not be empty".into()));
        }
        decode_base64_key(&self.psk)?;
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(ClientError::Config(format!(
                "packet_size must be within {}..={}",
                MIN_PACKET_SIZE, MAX_PACKET_SIZE
            )));
        }
        if self.max_in_flight == 0 {
            return Err(ClientError::Config("max_in_flight must be at least 1".into()));
        }
        let intervals = [
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ClientError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// 事前共有鍵の 16 バイト
    pub fn psk_bytes(&self) -> Result<[u8; 16], ClientError> {
        Ok(decode_base64_key(&self.psk)?)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            packet_size: self.packet_size,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            handshake_retries: self.handshake_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            client_id: self.client_id.clone(),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_in_flight: self.max_in_flight,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            reassembly_timeout: Duration::from_millis(self.reassembly_timeout_ms),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
