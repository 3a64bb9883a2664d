//! セッションの状態

use std::fmt;

/// セッションの状態
///
/// ```text
/// Disconnected → Handshaking → Established → Draining → Disconnected
///                    │                │
///                    └─(失敗)──────────┴─(切断/タイムアウト)→ Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Handshaking,
    Established,
    /// 切断処理中（新しい送信は受け付けない）
    Draining,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Handshaking => "handshaking",
            SessionState::Established => "established",
            SessionState::Draining => "draining",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
