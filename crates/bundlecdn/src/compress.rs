//! Best-effort gzip compression for bundle artifacts
//!
//! Compression is skipped for small inputs and for inputs that do not shrink
//! enough to be worth it; in both cases the original bytes are what gets
//! stored at the compressed path. Output is deterministic for identical input
//! so content-equality checks against the remote copy stay meaningful.

use crate::identity::ContentType;
use crate::{Error, Result};
use flate2::GzBuilder;
use std::io::Write;

/// Inputs at or below this many bytes are never compressed
pub const MIN_COMPRESS_SIZE: usize = 350;

/// Compressed output must be smaller than this fraction of the input
pub const MAX_COMPRESSED_RATIO: f64 = 0.95;

/// Gzip level used for every artifact
pub const GZIP_LEVEL: u32 = 9;

/// Why compression was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Content type is neither stylesheet nor script
    NotCompressible,
    /// Input is at or below the minimum size
    TooSmall {
        /// Input size in bytes
        size: usize,
    },
    /// Compressed output saved too little
    Ineffective {
        /// Input size in bytes
        original: usize,
        /// Gzip output size in bytes
        compressed: usize,
    },
}

/// Outcome of a compression attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    /// Gzip payload
    Gzip(Vec<u8>),
    /// Compression not applied
    Skip(SkipReason),
}

/// Bytes to store at a compressed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedVariant {
    /// Payload: gzip bytes, or the original bytes when compression was skipped
    pub bytes: Vec<u8>,
    /// Whether `bytes` is gzip encoded
    pub gzip: bool,
    /// Why compression was skipped, if it was
    pub skipped: Option<SkipReason>,
}

/// Deterministic gzip compressor with size and ratio guards
#[derive(Debug, Clone)]
pub struct Compressor {
    min_size: usize,
    max_ratio: f64,
    level: u32,
}

impl Default for Compressor {
    fn default() -> Self {
        Self {
            min_size: MIN_COMPRESS_SIZE,
            max_ratio: MAX_COMPRESSED_RATIO,
            level: GZIP_LEVEL,
        }
    }
}

impl Compressor {
    /// Compressor with the default thresholds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the minimum input size
    #[must_use]
    pub const fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Override the maximum compressed/original ratio
    #[must_use]
    pub const fn with_max_ratio(mut self, max_ratio: f64) -> Self {
        self.max_ratio = max_ratio;
        self
    }

    /// Try to compress `bytes`
    pub fn compress(&self, bytes: &[u8], content_type: ContentType) -> Result<Compression> {
        if !content_type.is_compressible() {
            return Ok(Compression::Skip(SkipReason::NotCompressible));
        }
        if bytes.len() <= self.min_size {
            return Ok(Compression::Skip(SkipReason::TooSmall { size: bytes.len() }));
        }

        let compressed = self.gzip(bytes)?;
        #[allow(clippy::cast_precision_loss)]
        let ratio = compressed.len() as f64 / bytes.len() as f64;
        if ratio >= self.max_ratio {
            return Ok(Compression::Skip(SkipReason::Ineffective {
                original: bytes.len(),
                compressed: compressed.len(),
            }));
        }
        Ok(Compression::Gzip(compressed))
    }

    /// What to store at the compressed path, `None` for non-compressible types
    pub fn variant(
        &self,
        bytes: &[u8],
        content_type: ContentType,
    ) -> Result<Option<CompressedVariant>> {
        Ok(match self.compress(bytes, content_type)? {
            Compression::Gzip(gzip) => Some(CompressedVariant {
                bytes: gzip,
                gzip: true,
                skipped: None,
            }),
            Compression::Skip(SkipReason::NotCompressible) => None,
            Compression::Skip(reason) => Some(CompressedVariant {
                bytes: bytes.to_vec(),
                gzip: false,
                skipped: Some(reason),
            }),
        })
    }

    fn gzip(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        // Zero mtime and no file name keep the header stable across runs
        let mut encoder = GzBuilder::new()
            .mtime(0)
            .write(Vec::new(), flate2::Compression::new(self.level));
        encoder
            .write_all(bytes)
            .map_err(|source| Error::Compression { source })?;
        encoder
            .finish()
            .map_err(|source| Error::Compression { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use proptest::prelude::*;
    use std::io::Read;

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn small_input_is_stored_as_is() {
        let input = b"body{color:red}";
        let variant = Compressor::new()
            .variant(input, ContentType::Stylesheet)
            .unwrap()
            .unwrap();
        assert!(!variant.gzip);
        assert_eq!(variant.bytes, input);
        assert_eq!(variant.skipped, Some(SkipReason::TooSmall { size: 15 }));
    }

    #[test]
    fn exactly_min_size_is_not_compressed() {
        let input = vec![b'a'; MIN_COMPRESS_SIZE];
        let result = Compressor::new()
            .compress(&input, ContentType::Script)
            .unwrap();
        assert_eq!(
            result,
            Compression::Skip(SkipReason::TooSmall {
                size: MIN_COMPRESS_SIZE
            })
        );
    }

    #[test]
    fn repetitive_stylesheet_compresses_well() {
        let input = "a{b:c}".repeat(400);
        let input = &input.as_bytes()[..2000];
        let result = Compressor::new()
            .compress(input, ContentType::Stylesheet)
            .unwrap();
        let Compression::Gzip(gzip) = result else {
            panic!("expected gzip output, got {result:?}");
        };
        assert!(gzip.len() < 50, "compressed to {} bytes", gzip.len());
        assert_eq!(gunzip(&gzip), input);
    }

    #[test]
    fn generic_content_bypasses_compression() {
        let input = vec![b'x'; 5000];
        let compressor = Compressor::new();
        assert_eq!(
            compressor.compress(&input, ContentType::Generic).unwrap(),
            Compression::Skip(SkipReason::NotCompressible)
        );
        assert_eq!(compressor.variant(&input, ContentType::Generic).unwrap(), None);
    }

    #[test]
    fn incompressible_input_keeps_original_bytes() {
        // xorshift noise does not shrink under gzip
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state.to_le_bytes()[0]
            })
            .collect();

        let variant = Compressor::new()
            .variant(&noise, ContentType::Script)
            .unwrap()
            .unwrap();
        assert!(!variant.gzip);
        assert_eq!(variant.bytes, noise);
        assert!(matches!(
            variant.skipped,
            Some(SkipReason::Ineffective { original: 4096, .. })
        ));
    }

    proptest! {
        #[test]
        fn compression_is_deterministic(input in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let compressor = Compressor::new();
            let first = compressor.compress(&input, ContentType::Script).unwrap();
            let second = compressor.compress(&input, ContentType::Script).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn small_inputs_are_never_compressed(input in proptest::collection::vec(any::<u8>(), 0..=MIN_COMPRESS_SIZE)) {
            let variant = Compressor::new()
                .variant(&input, ContentType::Stylesheet)
                .unwrap()
                .unwrap();
            prop_assert!(!variant.gzip);
            prop_assert_eq!(variant.bytes, input);
        }

        #[test]
        fn gzip_output_always_meets_ratio(input in proptest::collection::vec(any::<u8>(), MIN_COMPRESS_SIZE + 1..4096)) {
            match Compressor::new().compress(&input, ContentType::Stylesheet).unwrap() {
                Compression::Gzip(gzip) => {
                    prop_assert!((gzip.len() as f64) < input.len() as f64 * MAX_COMPRESSED_RATIO);
                    prop_assert_eq!(gunzip(&gzip), input);
                }
                Compression::Skip(SkipReason::Ineffective { original, compressed }) => {
                    prop_assert_eq!(original, input.len());
                    prop_assert!(compressed as f64 >= original as f64 * MAX_COMPRESSED_RATIO);
                }
                other => prop_assert!(false, "unexpected outcome {:?}", other),
            }
        }
    }
}
