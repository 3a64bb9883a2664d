//! # mix-proto
//!
//! ゲートウェイセッションのハンドシェイク・制御メッセージ（Protobuf）。
//!
//! ## ハンドシェイク
//!
//! ```text
//! Client                                   Gateway
//!   │ ClientHello { version, nonce, id }     │
//!   │───────────────────────────────────────>│
//!   │ GatewayHello { version, nonce, conf }  │
//!   │<───────────────────────────────────────│
//!   │        （以降は暗号化パケット）           │
//! ```
//!
//! どちらのメッセージも Handshake 種別のパケット本体に載る。
//! 切断時は CloseNotice を Close パケットに載せる。
//!
//! ## プロトコルバージョン
//!
//! パケットヘッダーの version バイトとハンドシェイクの protocol_version は
//! 同じ値 (PROTOCOL_VERSION) を使う。

pub mod error;

pub use error::ProtoError;

use prost::Message;

/// プロトコルバージョン
pub const PROTOCOL_VERSION: u8 = 1;

/// クライアントの最初のハンドシェイクメッセージ
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientHello {
    #[prost(uint32, optional, tag = "1")]
    pub protocol_version: Option<u32>,
    /// 16 バイトのクライアント nonce
    #[prost(bytes = "vec", tag = "2")]
    pub client_nonce: Vec<u8>,
    /// ゲートウェイ側のログ用の識別子
    #[prost(string, tag = "3")]
    pub client_id: String,
}

/// ゲートウェイの応答
#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayHello {
    #[prost(uint32, optional, tag = "1")]
    pub protocol_version: Option<u32>,
    /// 16 バイトのゲートウェイ nonce
    #[prost(bytes = "vec", tag = "2")]
    pub gateway_nonce: Vec<u8>,
    /// 導出したセッション鍵の確認値
    #[prost(bytes = "vec", tag = "3")]
    pub key_confirmation: Vec<u8>,
    /// 拒否理由（設定されていればハンドシェイク失敗）
    #[prost(string, optional, tag = "4")]
    pub reject_reason: Option<String>,
}

/// 切断通知
#[derive(Clone, PartialEq, prost::Message)]
pub struct CloseNotice {
    #[prost(string, tag = "1")]
    pub reason: String,
}

impl ClientHello {
    pub fn new(client_nonce: Vec<u8>, client_id: impl Into<String>) -> Self {
        ClientHello {
            protocol_version: Some(u32::from(PROTOCOL_VERSION)),
            client_nonce,
            client_id: client_id.into(),
        }
    }

    /// バイト列からデコードし、バージョンを検証する
    ///
    /// # エラー
    /// - `ProtoError::DecodeFailed`: protobuf デコード失敗
    /// - `ProtoError::InvalidProtocolVersion`: バージョン不一致
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let hello = ClientHello::decode(bytes)?;
        check_version(hello.protocol_version)?;
        Ok(hello)
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

impl GatewayHello {
    /// 受理の応答
    pub fn accept(gateway_nonce: Vec<u8>, key_confirmation: Vec<u8>) -> Self {
        GatewayHello {
            protocol_version: Some(u32::from(PROTOCOL_VERSION)),
            gateway_nonce,
            key_confirmation,
            reject_reason: None,
        }
    }

    /// 拒否の応答
    pub fn reject(reason: impl Into<String>) -> Self {
        GatewayHello {
            protocol_version: Some(u32::from(PROTOCOL_VERSION)),
            gateway_nonce: Vec::new(),
            key_confirmation: Vec::new(),
            reject_reason: Some(reason.into()),
        }
    }

    /// バイト列からデコードし、バージョンを検証する
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let hello = GatewayHello::decode(bytes)?;
        check_version(hello.protocol_version)?;
        Ok(hello)
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn is_rejected(&self) -> bool {
        self.reject_reason.is_some()
    }
}

impl CloseNotice {
    pub fn new(reason: impl Into<String>) -> Self {
        CloseNotice { reason: reason.into() }
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(CloseNotice::decode(bytes)?)
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

/// バージョンが設定されていて、かつ一致しない場合はエラー
fn check_version(version: Option<u32>) -> Result<(), ProtoError> {
    match version {
        Some(v) if v != u32::from(PROTOCOL_VERSION) => Err(ProtoError::InvalidProtocolVersion(v)),
        Some(_) => Ok(()),
        None => Err(ProtoError::MissingField("protocol_version")),
    }
}
