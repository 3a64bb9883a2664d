//! セッション設定

use std::time::Duration;

use mix_transport::DEFAULT_PACKET_SIZE;

use crate::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_HANDSHAKE_RETRIES,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_IDLE_TIMEOUT_MS,
};

/// セッション管理の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// ゲートウェイとやり取りするパケットのバイト数
    pub packet_size: usize,
    /// ハンドシェイク 1 回あたりの制限時間
    pub handshake_timeout: Duration,
    /// 初回のあとに再試行する回数
    pub handshake_retries: u32,
    /// 再試行の待ち時間の基準（n 回目は base * 2^n）
    pub backoff_base: Duration,
    /// 再試行の待ち時間の上限
    pub backoff_max: Duration,
    /// これだけ受信がなければリンクを切る
    pub idle_timeout: Duration,
    /// ClientHello に載せる識別子
    pub client_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            packet_size: DEFAULT_PACKET_SIZE,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            handshake_retries: DEFAULT_HANDSHAKE_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            client_id: String::from("mix-client"),
        }
    }
}

impl SessionConfig {
    /// `attempt` 回目（0 始まり）の失敗のあとに待つ時間
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}
