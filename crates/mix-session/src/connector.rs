//! ゲートウェイへのストリームを開く抽象
//!
//! セッション管理は信頼性のある双方向バイトストリームだけを前提にする。
//! 本番は TCP、テストは `tokio::io::duplex` を返す実装を差し込む。

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// ゲートウェイへの接続を開く能力
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// 接続で得られるストリームの型
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// `gateway` に接続する
    ///
    /// # エラー
    /// 到達不能・拒否などは `io::Error` として返す（セッション側でリトライ対象）
    async fn connect(&self, gateway: &str) -> io::Result<Self::Stream>;
}

/// TCP でゲートウェイに接続する
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, gateway: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(gateway).await?;
        // 固定長パケットを溜めずに送る
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = TcpConnector.connect(&addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
    }
}
