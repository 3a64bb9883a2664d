//! スライディングウィンドウ方式のリプレイ検出
//!
//! 最新の受信シーケンス番号から `REPLAY_WINDOW` 個分を 64 ビットのビットマップで管理する。
//! ウィンドウより古い番号と、既に受信済みの番号を拒否する。

use crate::error::CryptoError;

/// リプレイウィンドウの幅（シーケンス番号数）
pub const REPLAY_WINDOW: u64 = 64;

/// 受信シーケンス番号のリプレイウィンドウ
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    /// これまでに受理した最大のシーケンス番号
    highest: Option<u64>,
    /// bit i = highest - i を受理済み
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// `seq` を受理できるかを確認する（状態は変更しない）
    ///
    /// 認証タグ検証の前に呼び出し、検証に成功してから [`commit`](Self::commit) する。
    pub fn check(&self, seq: u64) -> Result<(), CryptoError> {
        let Some(highest) = self.highest else {
            return Ok(());
        };
        if seq > highest {
            return Ok(());
        }
        let age = highest - seq;
        if age >= REPLAY_WINDOW || self.bitmap & (1u64 << age) != 0 {
            return Err(CryptoError::ReplayAttack(seq));
        }
        Ok(())
    }

    /// `seq` を受理済みとして記録する
    pub fn commit(&mut self, seq: u64) {
        match self.highest {
            None => {
                self.highest = Some(seq);
                self.bitmap = 1;
            }
            Some(highest) if seq > highest => {
                let shift = seq - highest;
                self.bitmap = if shift >= REPLAY_WINDOW { 0 } else { self.bitmap << shift };
                self.bitmap |= 1;
                self.highest = Some(seq);
            }
            Some(highest) => {
                let age = highest - seq;
                if age < REPLAY_WINDOW {
                    self.bitmap |= 1u64 << age;
                }
            }
        }
    }

    /// 受理済みの最大シーケンス番号
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }
}
