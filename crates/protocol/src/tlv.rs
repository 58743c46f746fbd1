//! TLV8 encoding used by the pairing endpoints.
//!
//! # Format
//!
//! Each item is:
//! - 1 byte: type
//! - 1 byte: length (0-255)
//! - N bytes: value
//!
//! Values longer than 255 bytes are written as consecutive fragments of
//! the same type, every fragment but the last being exactly 255 bytes. The
//! decoder joins consecutive fragments of one type back together.

use crate::error::{ProtocolError, Result};

/// Largest value a single TLV item can carry.
pub const MAX_FRAGMENT_LENGTH: usize = 255;

/// Item types understood by the pairing endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    /// Pairing method (0 = pair-setup).
    Method = 0x00,
    /// Pairing identifier of the sender.
    Identifier = 0x01,
    /// SRP salt.
    Salt = 0x02,
    /// SRP or X25519 public key, or Ed25519 long-term key in sub-TLVs.
    PublicKey = 0x03,
    /// SRP proof.
    Proof = 0x04,
    /// ChaCha20-Poly1305 sealed sub-TLV.
    EncryptedData = 0x05,
    /// Message number within an exchange (M1..M4).
    State = 0x06,
    /// Error code, see [`TlvErrorCode`].
    Error = 0x07,
    /// Ed25519 signature.
    Signature = 0x0A,
}

impl TlvType {
    /// Returns the wire byte for this type.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Error codes carried in a [`TlvType::Error`] item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvErrorCode {
    /// Generic failure.
    Unknown = 0x01,
    /// Bad PIN, proof or signature.
    Authentication = 0x02,
    /// The receiver cannot accept pairing right now.
    Unavailable = 0x06,
}

impl TlvErrorCode {
    /// Parses an error code byte. Unrecognised codes map to `Unknown`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x02 => TlvErrorCode::Authentication,
            0x06 => TlvErrorCode::Unavailable,
            _ => TlvErrorCode::Unknown,
        }
    }
}

/// An ordered list of TLV8 items.
///
/// Unknown item types are preserved so they survive a decode/encode pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tlv8 {
    items: Vec<(u8, Vec<u8>)>,
}

impl Tlv8 {
    /// Creates an empty item list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item and returns `self`, for building messages inline.
    pub fn with(mut self, ty: TlvType, value: impl Into<Vec<u8>>) -> Self {
        self.push(ty, value);
        self
    }

    /// Appends a one-byte `State` item.
    pub fn with_state(self, state: u8) -> Self {
        self.with(TlvType::State, vec![state])
    }

    /// Appends an item.
    pub fn push(&mut self, ty: TlvType, value: impl Into<Vec<u8>>) {
        self.items.push((ty.as_byte(), value.into()));
    }

    /// Returns the first value of the given type.
    pub fn get(&self, ty: TlvType) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|(t, _)| *t == ty.as_byte())
            .map(|(_, v)| v.as_slice())
    }

    /// Returns the value of a mandatory item.
    pub fn require(&self, ty: TlvType) -> Result<&[u8]> {
        self.get(ty).ok_or(ProtocolError::MissingTlvItem(ty))
    }

    /// Returns the message number of this message.
    pub fn state(&self) -> Result<u8> {
        match self.require(TlvType::State)? {
            [state] => Ok(*state),
            other => Err(ProtocolError::MalformedTlv(format!(
                "state item must be 1 byte, got {}",
                other.len()
            ))),
        }
    }

    /// Returns the error code, if the message carries one.
    pub fn error(&self) -> Option<TlvErrorCode> {
        self.get(TlvType::Error)
            .and_then(|v| v.first())
            .map(|b| TlvErrorCode::from_byte(*b))
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if there are no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encodes the items, fragmenting long values.
    pub fn encode(&self) -> Vec<u8> {
        let capacity = self
            .items
            .iter()
            .map(|(_, v)| v.len() + 2 * (v.len() / MAX_FRAGMENT_LENGTH + 1))
            .sum();
        let mut out = Vec::with_capacity(capacity);

        for (ty, value) in &self.items {
            if value.is_empty() {
                out.extend_from_slice(&[*ty, 0]);
                continue;
            }
            for chunk in value.chunks(MAX_FRAGMENT_LENGTH) {
                out.push(*ty);
                out.push(chunk.len() as u8);
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    /// Decodes a TLV8 byte string.
    ///
    /// A fragment continues the previous item when it has the same type and
    /// the previous fragment was full (255 bytes).
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut items: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut last_fragment_full = false;
        let mut pos = 0;

        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(ProtocolError::MalformedTlv(format!(
                    "truncated item header at offset {}",
                    pos
                )));
            }
            let ty = data[pos];
            let len = data[pos + 1] as usize;
            pos += 2;

            if pos + len > data.len() {
                return Err(ProtocolError::MalformedTlv(format!(
                    "item of type {:#04x} needs {} bytes, {} remain",
                    ty,
                    len,
                    data.len() - pos
                )));
            }
            let value = &data[pos..pos + len];
            pos += len;

            let continues = last_fragment_full && items.last().is_some_and(|(t, _)| *t == ty);
            if continues {
                if let Some((_, last_value)) = items.last_mut() {
                    last_value.extend_from_slice(value);
                }
            } else {
                items.push((ty, value.to_vec()));
            }
            last_fragment_full = len == MAX_FRAGMENT_LENGTH;
        }

        Ok(Self { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_small_items() {
        let tlv = Tlv8::new()
            .with_state(2)
            .with(TlvType::Salt, vec![0xAA, 0xBB]);

        assert_eq!(
            tlv.encode(),
            vec![0x06, 0x01, 0x02, 0x02, 0x02, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_long_value_is_fragmented_and_rejoined() {
        let key: Vec<u8> = (0..384u32).map(|i| (i % 251) as u8).collect();
        let encoded = Tlv8::new()
            .with_state(2)
            .with(TlvType::PublicKey, key.clone())
            .encode();

        // state item + 255 fragment + 129 fragment
        assert_eq!(encoded.len(), 3 + 2 + 255 + 2 + 129);
        assert_eq!(encoded[3], TlvType::PublicKey.as_byte());
        assert_eq!(encoded[4], 255);
        assert_eq!(encoded[3 + 2 + 255 + 1], 129);

        let decoded = Tlv8::decode(&encoded).unwrap();
        assert_eq!(decoded.get(TlvType::PublicKey).unwrap(), key.as_slice());
        assert_eq!(decoded.state().unwrap(), 2);
    }

    #[test]
    fn test_exactly_255_bytes_is_single_fragment() {
        let value = vec![7u8; 255];
        let encoded = Tlv8::new().with(TlvType::Proof, value.clone()).encode();
        assert_eq!(encoded.len(), 257);
        assert_eq!(Tlv8::decode(&encoded).unwrap().get(TlvType::Proof).unwrap(), &value[..]);
    }

    #[test]
    fn test_empty_value() {
        let encoded = Tlv8::new().with(TlvType::Method, Vec::new()).encode();
        assert_eq!(encoded, vec![0x00, 0x00]);
        let decoded = Tlv8::decode(&encoded).unwrap();
        assert_eq!(decoded.get(TlvType::Method), Some(&[][..]));
    }

    #[test]
    fn test_separate_short_items_of_same_type_not_merged() {
        let data = [0x01, 0x01, b'a', 0x01, 0x01, b'b'];
        let decoded = Tlv8::decode(&data).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get(TlvType::Identifier).unwrap(), b"a");
    }

    #[test]
    fn test_truncated_header() {
        let err = Tlv8::decode(&[0x06]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedTlv(_)));
    }

    #[test]
    fn test_truncated_value() {
        let err = Tlv8::decode(&[0x06, 0x05, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedTlv(_)));
    }

    #[test]
    fn test_require_missing_item() {
        let tlv = Tlv8::new().with_state(1);
        let err = tlv.require(TlvType::Proof).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingTlvItem(TlvType::Proof)));
    }

    #[test]
    fn test_state_must_be_single_byte() {
        let tlv = Tlv8::new().with(TlvType::State, vec![1, 2]);
        assert!(matches!(tlv.state(), Err(ProtocolError::MalformedTlv(_))));
    }

    #[test]
    fn test_unknown_types_preserved() {
        let data = [0x1B, 0x01, 0x42, 0x06, 0x01, 0x03];
        let decoded = Tlv8::decode(&data).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.encode(), data.to_vec());
    }

    #[test]
    fn test_error_code() {
        let tlv = Tlv8::new()
            .with_state(4)
            .with(TlvType::Error, vec![TlvErrorCode::Authentication as u8]);
        assert_eq!(tlv.error(), Some(TlvErrorCode::Authentication));
        assert_eq!(TlvErrorCode::from_byte(0x55), TlvErrorCode::Unknown);
    }
}
