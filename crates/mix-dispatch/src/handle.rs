//! 送信結果を待つハンドル

use mix_transport::PayloadId;
use tokio::sync::oneshot;

use crate::error::DispatchError;

pub(crate) type AckSender = oneshot::Sender<Result<(), DispatchError>>;

/// 1 パケットの ACK を待つハンドル
#[derive(Debug)]
pub struct AckHandle {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    /// ACK 不要の種別（キューに積んだ時点で完了）
    Ready,
    Waiting(oneshot::Receiver<Result<(), DispatchError>>),
}

impl AckHandle {
    pub(crate) fn ready() -> Self {
        AckHandle { inner: Inner::Ready }
    }

    pub(crate) fn waiting() -> (AckSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, AckHandle {
            inner: Inner::Waiting(rx),
        })
    }

    /// ACK を待つ
    ///
    /// # エラー
    /// - `DispatchError::Timeout`: ACK が制限時間内に届かなかった
    /// - `DispatchError::SessionClosed`: 待っている間にセッションが閉じた
    pub async fn acknowledged(self) -> Result<(), DispatchError> {
        match self.inner {
            Inner::Ready => Ok(()),
            Inner::Waiting(rx) => rx.await.unwrap_or(Err(DispatchError::SessionClosed)),
        }
    }
}

/// 1 Payload の全 Fragment の ACK をまとめて待つハンドル
#[derive(Debug)]
pub struct DeliveryHandle {
    payload_id: PayloadId,
    acks: Vec<AckHandle>,
}

impl DeliveryHandle {
    pub fn new(payload_id: PayloadId, acks: Vec<AckHandle>) -> Self {
        DeliveryHandle { payload_id, acks }
    }

    pub fn payload_id(&self) -> PayloadId {
        self.payload_id
    }

    pub fn fragment_count(&self) -> usize {
        self.acks.len()
    }

    /// すべての Fragment が ACK されるのを待つ。最初の失敗を返す。
    pub async fn delivered(self) -> Result<(), DispatchError> {
        for ack in self.acks {
            ack.acknowledged().await?;
        }
        Ok(())
    }
}
