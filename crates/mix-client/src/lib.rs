//! # mix-client
//!
//! ミックスネットのクライアントコア：アプリケーションから使う公開 API。
//!
//! ## 使用方法
//!
//! ```no_run
//! # async fn run() -> Result<(), mix_client::ClientError> {
//! use mix_client::{ClientConfig, MixnetClient};
//!
//! let config = ClientConfig::from_json(
//!     r#"{"gateway":"127.0.0.1:1789","psk":"4NeCCgvZFe2RnPgrcU1PQw"}"#,
//! )?;
//! let client = MixnetClient::connect(config).await?;
//!
//! // 受信メッセージ
//! let mut inbox = client.subscribe(64);
//!
//! // 送信して ACK を待つ
//! let delivery = client.send(b"hello mixnet".to_vec()).await?;
//! delivery.delivered().await?;
//!
//! if let Some(message) = inbox.recv().await {
//!     println!("{} bytes", message.payload.len());
//! }
//! println!("{}", client.stats_json()?);
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::{ClientStats, MessageCallback, MixnetClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use mix_dispatch::{DeliveryHandle, ReceivedMessage};
pub use mix_session::SessionState;

/// Keepalive の送信間隔（ミリ秒）
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 10_000;

/// `send` がセッション確立を待つ上限（ミリ秒）
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// 期限切れの ACK 待ち・組み立て途中を掃除する間隔（ミリ秒）
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;
