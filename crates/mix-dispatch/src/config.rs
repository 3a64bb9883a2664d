//! ディスパッチャ設定

use std::time::Duration;

use crate::{DEFAULT_ACK_TIMEOUT_MS, DEFAULT_MAX_IN_FLIGHT, DEFAULT_REASSEMBLY_TIMEOUT_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// ACK 待ちにできるパケット数の上限
    pub max_in_flight: usize,
    /// 送信から ACK までの制限時間
    pub ack_timeout: Duration,
    /// 最初の Fragment から Payload が揃うまでの制限時間
    pub reassembly_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            reassembly_timeout: Duration::from_millis(DEFAULT_REASSEMBLY_TIMEOUT_MS),
        }
    }
}
