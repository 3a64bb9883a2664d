//! # mix-dispatch
//!
//! セッションとアプリケーションの間でパケットを振り分けるレイヤー。
//!
//! ## 送信
//!
//! ```text
//! submit(packet)
//!   → in-flight 枠を取得（上限なら待つ）
//!   → Data なら (payload_id, seq) で ACK 待ちに登録
//!   → FIFO キュー → 送信ループ → SessionManager::send
//! ```
//!
//! ## 受信
//!
//! ```text
//! SessionManager::receive → on_receive(packet)
//!   Ack  → ACK 待ちを解決し枠を返す（対応なしは UnmatchedPacket）
//!   Data → 再組み立て + ACK を返す → 揃えばメッセージ
//! ```
//!
//! 期限切れの ACK 待ちはハンドルに `Timeout` を通知し、
//! 期限切れの組み立て途中の Payload は黙って捨てる。

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handle;

pub use config::DispatcherConfig;
pub use dispatcher::{DispatchStats, Dispatcher, Inbound, OutboundQueue, ReceivedMessage};
pub use error::DispatchError;
pub use handle::{AckHandle, DeliveryHandle};

/// 既定の in-flight 上限
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// 既定の ACK 制限時間（ミリ秒）
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;

/// 既定の再組み立て制限時間（ミリ秒）
pub const DEFAULT_REASSEMBLY_TIMEOUT_MS: u64 = 30_000;
