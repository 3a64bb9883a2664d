//! パケット Nonce 実装
//!
//! ## Nonce 構造（12バイト）
//! ```text
//! bytes[0..4]  = 0x00000000  (ゼロパディング)
//! bytes[4..12] = direction_seq as u64, big-endian
//! ```
//!
//! 封緘済みボディには nonce の後半 8 バイト（bytes[4..12]）のみ載せる
//! （先頭 4 バイトは常にゼロなので省略）

use crate::Direction;

/// パケットの Nonce（12バイト）
///
/// direction ビット込みのシーケンス番号から構築され、AES-128-OCB3 の nonce として使用される。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNonce([u8; 12]);

impl PacketNonce {
    /// nonce の後半部分の長さ
    pub const TAIL_LEN: usize = 8;

    /// direction ビット込みのシーケンス番号から Nonce を構築する
    ///
    /// # 例
    /// ```
    /// use mix_crypto::PacketNonce;
    /// let nonce = PacketNonce::new(42);
    /// assert_eq!(nonce.direction_seq(), 42);
    /// ```
    pub fn new(direction_seq: u64) -> Self {
        let mut bytes = [0u8; 12];
        bytes[4..12].copy_from_slice(&direction_seq.to_be_bytes());
        PacketNonce(bytes)
    }

    /// 方向とシーケンス番号から Nonce を構築する
    pub fn for_direction(direction: Direction, seq: u64) -> Self {
        Self::new(direction.apply_to_seq(seq))
    }

    /// 封緘済みボディの先頭 8 バイトから Nonce を復元する
    ///
    /// 8 バイト未満なら `None`。
    pub fn from_sealed_prefix(bytes: &[u8]) -> Option<Self> {
        let tail: [u8; 8] = bytes.get(..Self::TAIL_LEN)?.try_into().ok()?;
        let mut nonce = [0u8; 12];
        nonce[4..12].copy_from_slice(&tail);
        Some(PacketNonce(nonce))
    }

    /// direction ビット込みのシーケンス番号
    pub fn direction_seq(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[4..12]);
        u64::from_be_bytes(buf)
    }

    /// direction ビットを除いたシーケンス番号
    pub fn seq(&self) -> u64 {
        Direction::strip_seq(self.direction_seq())
    }

    /// このパケットの方向
    pub fn direction(&self) -> Direction {
        Direction::from_seq(self.direction_seq())
    }

    /// AES-OCB3 の nonce 引数として使用する 12 バイト
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// 封緘済みボディに埋め込む 8 バイト（nonce の後半）
    pub fn tail_bytes(&self) -> &[u8] {
        &self.0[4..12]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_zero_padding() {
        let nonce = PacketNonce::new(u64::MAX);
        assert_eq!(&nonce.as_bytes()[0..4], &[0u8; 4]);
        assert_eq!(&nonce.as_bytes()[4..12], &[0xFF; 8]);
    }

    #[test]
    fn test_nonce_from_sealed_prefix() {
        let original = PacketNonce::for_direction(Direction::ToClient, 7);
        let mut sealed = original.tail_bytes().to_vec();
        sealed.extend_from_slice(b"ciphertext");

        let restored = PacketNonce::from_sealed_prefix(&sealed).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.seq(), 7);
        assert_eq!(restored.direction(), Direction::ToClient);
    }

    #[test]
    fn test_nonce_prefix_too_short() {
        assert!(PacketNonce::from_sealed_prefix(&[0u8; 7]).is_none());
    }
}
