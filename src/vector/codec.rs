//! Vector byte codec
//!
//! The only layout ever written is `D` little-endian IEEE-754 float32 values
//! back to back, `4 * D` bytes with no framing. Two older layouts are still
//! accepted on read:
//!
//! - hex text of the same float32 bytes (`8 * D` ASCII hex digits)
//! - standard base64 text of the same float32 bytes
//!
//! Anything else, including non-finite components, is a corrupt vector.

use crate::error::{DocCacheError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Layout a stored payload was recognised as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorEncoding {
    Canonical,
    LegacyHex,
    LegacyBase64,
}

/// Encoder/decoder for one fixed dimensionality
#[derive(Debug, Clone, Copy)]
pub struct VectorCodec {
    dimension: usize,
}

impl VectorCodec {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Size of a canonical payload
    pub fn byte_len(&self) -> usize {
        self.dimension * 4
    }

    /// Check a vector's length against `D`
    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(DocCacheError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Encode to the canonical layout
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        self.check_dimension(vector)?;
        let mut bytes = Vec::with_capacity(self.byte_len());
        for value in vector {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Ok(bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        self.decode_detect(bytes).map(|(vector, _)| vector)
    }

    /// Decode, reporting which layout matched
    pub fn decode_detect(&self, bytes: &[u8]) -> Result<(Vec<f32>, VectorEncoding)> {
        if bytes.len() == self.byte_len() {
            return self
                .floats(bytes)
                .map(|vector| (vector, VectorEncoding::Canonical));
        }

        if bytes.len() == self.byte_len() * 2 {
            if let Ok(raw) = hex::decode(bytes) {
                return self
                    .floats(&raw)
                    .map(|vector| (vector, VectorEncoding::LegacyHex));
            }
        }

        if let Ok(text) = std::str::from_utf8(bytes) {
            if let Ok(raw) = STANDARD.decode(text.trim()) {
                if raw.len() == self.byte_len() {
                    return self
                        .floats(&raw)
                        .map(|vector| (vector, VectorEncoding::LegacyBase64));
                }
            }
        }

        Err(DocCacheError::CorruptVector(format!(
            "{} bytes match no known layout for dimension {}",
            bytes.len(),
            self.dimension
        )))
    }

    fn floats(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        if let Some(position) = vector.iter().position(|v| !v.is_finite()) {
            return Err(DocCacheError::CorruptVector(format!(
                "non-finite component at position {}",
                position
            )));
        }

        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<f32> {
        vec![0.25, -1.5, 3.0e-7, 1234.5678]
    }

    #[test]
    fn test_round_trip() {
        let codec = VectorCodec::new(4);
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_layout_is_little_endian_without_framing() {
        let codec = VectorCodec::new(1);
        assert_eq!(codec.encode(&[1.0]).unwrap(), vec![0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn test_dimension_guard() {
        let codec = VectorCodec::new(4);
        for len in [0, 3, 5] {
            match codec.encode(&vec![0.5; len]) {
                Err(DocCacheError::DimensionMismatch { expected, actual }) => {
                    assert_eq!(expected, 4);
                    assert_eq!(actual, len);
                }
                other => panic!("expected dimension mismatch, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_legacy_hex_layout() {
        let codec = VectorCodec::new(4);
        let canonical = codec.encode(&sample()).unwrap();
        let encoded = hex::encode(&canonical);

        let (vector, encoding) = codec.decode_detect(encoded.as_bytes()).unwrap();
        assert_eq!(encoding, VectorEncoding::LegacyHex);
        assert_eq!(vector, sample());

        let upper = encoded.to_uppercase();
        assert_eq!(codec.decode(upper.as_bytes()).unwrap(), sample());
    }

    #[test]
    fn test_legacy_base64_layout() {
        let codec = VectorCodec::new(4);
        let canonical = codec.encode(&sample()).unwrap();
        let text = STANDARD.encode(&canonical);

        let (vector, encoding) = codec.decode_detect(text.as_bytes()).unwrap();
        assert_eq!(encoding, VectorEncoding::LegacyBase64);
        assert_eq!(vector, sample());
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let codec = VectorCodec::new(4);
        for bytes in [&b"short"[..], &[0u8; 15][..], &[0xffu8; 40][..], &b""[..]] {
            assert!(matches!(
                codec.decode(bytes),
                Err(DocCacheError::CorruptVector(_))
            ));
        }
    }

    #[test]
    fn test_non_finite_is_corrupt() {
        let codec = VectorCodec::new(2);
        let mut bytes = 1.0f32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&f32::NAN.to_le_bytes());
        assert!(matches!(
            codec.decode(&bytes),
            Err(DocCacheError::CorruptVector(_))
        ));
    }
}
