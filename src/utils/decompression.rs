use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;

use crate::errors::{SourceError, SourceResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression formats recognised by magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Uncompressed,
}

/// Magic byte detection and decompression of provider payloads
pub struct DecompressionService;

impl DecompressionService {
    pub fn detect_compression_format(data: &[u8]) -> CompressionFormat {
        if data.starts_with(&GZIP_MAGIC) {
            CompressionFormat::Gzip
        } else {
            CompressionFormat::Uncompressed
        }
    }

    /// Decompress when the payload is compressed, otherwise hand it back untouched
    pub fn decompress(data: Bytes) -> SourceResult<Bytes> {
        match Self::detect_compression_format(&data) {
            CompressionFormat::Gzip => Self::decompress_gzip(&data).map(Bytes::from),
            CompressionFormat::Uncompressed => Ok(data),
        }
    }

    fn decompress_gzip(data: &[u8]) -> SourceResult<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        // EPG documents usually inflate to several times their compressed size
        let mut decompressed = Vec::with_capacity(data.len() * 4);
        decoder.read_to_end(&mut decompressed).map_err(|e| {
            SourceError::invalid_format(format!("failed to decompress gzip payload: {e}"))
        })?;
        Ok(decompressed)
    }
}
