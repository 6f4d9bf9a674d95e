//! Pluggable payload codecs
//!
//! Compression is a transform applied to journal record payloads, blob
//! payloads, or the key region of compact btree nodes. Codecs are identified
//! by a stable on-disk tag so an environment refuses payloads it cannot
//! decode.

use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::error::{Error, ErrorKind, Result};

/// Payload transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Codec {
    #[default]
    None = 0,
    Zlib = 1,
}

impl Codec {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Zlib),
            _ => Err(Error::with_detail(ErrorKind::FilterNotFound, format!("codec tag {v}"))),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Codec::None)
    }

    /// Encode `data`. For `Codec::None` this is a plain copy.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decode `data`. Failures map to `IntegrityViolated`: a payload that
    /// does not decode is corrupt, not merely unreadable.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Zlib => {
                let mut decoder = ZlibDecoder::new(Vec::new());
                decoder
                    .write_all(data)
                    .map_err(|_| Error::new(ErrorKind::IntegrityViolated))?;
                decoder
                    .finish()
                    .map_err(|_| Error::new(ErrorKind::IntegrityViolated))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn test_zlib_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let packed = Codec::Zlib.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(Codec::Zlib.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_none_is_identity() {
        let data = vec![1u8, 2, 3];
        assert_eq!(Codec::None.compress(&data).unwrap(), data);
        assert_eq!(Codec::None.decompress(&data).unwrap(), data);
    }

    #[test]
    fn test_garbage_is_integrity_violation() {
        let err = Codec::Zlib.decompress(b"definitely not zlib").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolated);
    }

    quickcheck! {
        fn prop_zlib_roundtrip(data: Vec<u8>) -> bool {
            let packed = Codec::Zlib.compress(&data).unwrap();
            Codec::Zlib.decompress(&packed).unwrap() == data
        }
    }
}
