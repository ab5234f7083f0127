//! Content-encoding aware body transcoding
//!
//! Bodies are decoded before substitution and re-encoded with the encoding the
//! origin chose, so the client never notices the rewrite.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use http::header::CONTENT_ENCODING;
use http::HeaderMap;

use crate::error::{Result, VillipError};

/// Body encodings the rewrite engine can see through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    /// Anything else; such bodies are never rewritten
    Unsupported(String),
}

impl ContentEncoding {
    /// Read the encoding from the `Content-Encoding` header
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let raw = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match raw.as_str() {
            "" | "identity" => Self::Identity,
            "gzip" | "x-gzip" => Self::Gzip,
            "deflate" => Self::Deflate,
            _ => Self::Unsupported(raw),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }

    /// Decode a body into its plain bytes
    pub fn decode(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Self::Identity => out.extend_from_slice(body),
            Self::Gzip => {
                GzDecoder::new(body)
                    .read_to_end(&mut out)
                    .map_err(|e| VillipError::Decode(e.to_string()))?;
            }
            Self::Deflate => {
                ZlibDecoder::new(body)
                    .read_to_end(&mut out)
                    .map_err(|e| VillipError::Decode(e.to_string()))?;
            }
            Self::Unsupported(name) => {
                return Err(VillipError::Decode(format!("unsupported encoding {}", name)))
            }
        }
        Ok(out)
    }

    /// Encode plain bytes back into this encoding
    pub fn encode(&self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(body.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(body.len()), Compression::default());
                encoder
                    .write_all(body)
                    .map_err(|e| VillipError::Encode(e.to_string()))?;
                encoder.finish().map_err(|e| VillipError::Encode(e.to_string()))
            }
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len()), Compression::default());
                encoder
                    .write_all(body)
                    .map_err(|e| VillipError::Encode(e.to_string()))?;
                encoder.finish().map_err(|e| VillipError::Encode(e.to_string()))
            }
            Self::Unsupported(name) => {
                Err(VillipError::Encode(format!("unsupported encoding {}", name)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(encoding: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        headers
    }

    #[test]
    fn test_from_headers() {
        assert_eq!(ContentEncoding::from_headers(&HeaderMap::new()), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::from_headers(&headers_with("gzip")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_headers(&headers_with("GZIP")), ContentEncoding::Gzip);
        assert_eq!(
            ContentEncoding::from_headers(&headers_with("deflate")),
            ContentEncoding::Deflate
        );
        assert_eq!(
            ContentEncoding::from_headers(&headers_with("br")),
            ContentEncoding::Unsupported("br".to_string())
        );
    }

    #[test]
    fn test_gzip_round_trip() {
        let text = b"take your book,\ntry to dance\n sing often";
        let encoded = ContentEncoding::Gzip.encode(text).unwrap();
        assert_ne!(encoded.as_slice(), text.as_slice());
        assert_eq!(ContentEncoding::Gzip.decode(&encoded).unwrap(), text.to_vec());
    }

    #[test]
    fn test_deflate_round_trip() {
        let text = b"walk outside,\n play boardgames";
        let encoded = ContentEncoding::Deflate.encode(text).unwrap();
        assert_eq!(ContentEncoding::Deflate.decode(&encoded).unwrap(), text.to_vec());
    }

    #[test]
    fn test_malformed_gzip_is_an_error() {
        let err = ContentEncoding::Gzip.decode(b"hello world").unwrap_err();
        assert!(matches!(err, VillipError::Decode(_)));
    }

    #[test]
    fn test_identity_is_passthrough() {
        assert_eq!(ContentEncoding::Identity.decode(b"abc").unwrap(), b"abc".to_vec());
        assert_eq!(ContentEncoding::Identity.encode(b"abc").unwrap(), b"abc".to_vec());
    }
}
