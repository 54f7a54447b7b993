//! Content gate
//!
//! Two independent checks that must both pass before any byte is relayed:
//! the declared `Content-Type`, and the leading bytes matched against known
//! raster image signatures.

use std::fmt;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use thiserror::Error;

/// Bytes required before signature matching
pub const SNIFF_LEN: usize = 12;

const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const GIF_MAGIC: &[u8] = &[0x47, 0x49, 0x46, 0x38];
const RIFF_MAGIC: &[u8] = b"RIFF";
const WEBP_MAGIC: &[u8] = b"WEBP";

/// Sniffed image format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("missing Content-Type header")]
    MissingContentType,

    #[error("content type {0:?} is not an image")]
    NotImage(String),

    #[error("SVG content is not allowed")]
    Svg,

    #[error("body too small: {size} bytes (need {min})")]
    TooSmall { size: usize, min: usize },

    #[error("leading bytes match no supported image signature")]
    BadSignature,
}

/// Check the declared content type. Returns the header value to relay.
pub fn check_content_type(headers: &HeaderMap) -> Result<String, ContentError> {
    let raw = headers
        .get(CONTENT_TYPE)
        .ok_or(ContentError::MissingContentType)?
        .to_str()
        .map_err(|_| ContentError::NotImage("<non-ascii>".to_string()))?
        .trim();

    let essence = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if !essence.starts_with("image/") {
        return Err(ContentError::NotImage(raw.to_string()));
    }
    if essence == "image/svg+xml" {
        return Err(ContentError::Svg);
    }

    Ok(raw.to_string())
}

/// Match leading bytes against the supported signatures.
pub fn sniff_signature(prefix: &[u8]) -> Result<ImageFormat, ContentError> {
    if prefix.len() < SNIFF_LEN {
        return Err(ContentError::TooSmall {
            size: prefix.len(),
            min: SNIFF_LEN,
        });
    }

    if prefix.starts_with(PNG_MAGIC) {
        Ok(ImageFormat::Png)
    } else if prefix.starts_with(JPEG_MAGIC) {
        Ok(ImageFormat::Jpeg)
    } else if prefix.starts_with(GIF_MAGIC) {
        Ok(ImageFormat::Gif)
    } else if prefix.starts_with(RIFF_MAGIC) && &prefix[8..12] == WEBP_MAGIC {
        Ok(ImageFormat::Webp)
    } else {
        Err(ContentError::BadSignature)
    }
}

/// Run both checks.
pub fn check(headers: &HeaderMap, first_bytes: &[u8]) -> Result<(String, ImageFormat), ContentError> {
    let content_type = check_content_type(headers)?;
    let format = sniff_signature(first_bytes)?;
    Ok((content_type, format))
}
