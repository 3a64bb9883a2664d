//! # mix-session
//!
//! ゲートウェイとの暗号化セッションの管理。
//!
//! ## セッションの状態遷移
//!
//! ```text
//! Disconnected → Handshaking → Established → Draining → Disconnected
//! ```
//!
//! ## ハンドシェイク
//!
//! 1. `Connector` でゲートウェイへのストリームを開く
//! 2. ClientHello（クライアント nonce）を鍵なしパケットで送る
//! 3. GatewayHello（ゲートウェイ nonce + 鍵確認値）を受け取る
//! 4. `KeyExchange` で鍵を導出し、確認値を検証する
//!
//! 一時的な失敗は `backoff_base * 2^n`（上限 `backoff_max`）待って
//! `handshake_retries` 回まで再試行する。
//!
//! ## 生存確認
//!
//! Keepalive の送信間隔はクライアント側のタイマーが決める。ゲートウェイ
//! （`GatewayLink`）は Keepalive を受け取るたびに Keepalive を返す。
//! `idle_timeout` の間なにも受信できなければリンクを切る。

pub mod config;
pub mod connector;
pub mod error;
mod frame;
pub mod manager;
pub mod responder;
pub mod state;

pub use config::SessionConfig;
pub use connector::{Connector, TcpConnector};
pub use error::SessionError;
pub use manager::SessionManager;
pub use responder::{GatewayLink, GatewayResponder};
pub use state::SessionState;

/// ハンドシェイク 1 回の制限時間（ミリ秒）
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// ハンドシェイクの再試行回数
pub const DEFAULT_HANDSHAKE_RETRIES: u32 = 3;

/// 再試行の待ち時間の基準（ミリ秒）
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 100;

/// 再試行の待ち時間の上限（ミリ秒）
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5000;

/// 受信が途絶えたとみなすまでの時間（ミリ秒）
/// Keepalive 間隔の数倍にする
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
