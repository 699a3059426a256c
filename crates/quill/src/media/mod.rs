//! Image normalization for outbound completion requests.
//!
//! Inbound images arrive as data URIs. Payloads over the configured byte
//! budget are re-encoded: lossy formats walk a descending quality ladder
//! and fall back to dimension scaling at the quality floor; lossless
//! formats are scaled only. Re-encoding is best-effort: a payload that
//! cannot be decoded is passed through unchanged rather than failing the
//! request.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::DynamicImage;
use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;
use tracing::warn;

/// Image normalization policy.
///
/// The quality ladder constants are configuration, not literals, so the
/// policy can be audited and tuned without touching code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Maximum encoded image size in kilobytes.
    pub budget_kb: u32,
    /// Initial JPEG re-encode quality.
    pub jpeg_quality_start: u8,
    /// Quality decrement per re-encode attempt.
    pub jpeg_quality_step: u8,
    /// Lowest acceptable JPEG quality.
    pub jpeg_quality_floor: u8,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            budget_kb: 4096,
            jpeg_quality_start: 85,
            jpeg_quality_step: 10,
            jpeg_quality_floor: 30,
        }
    }
}

/// A normalized image ready to attach to a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    /// Base64-encoded payload (no data-URI header).
    pub data: String,
    /// MIME type of the payload.
    pub media_type: String,
}

/// Errors for inputs that cannot even be split into header and payload.
///
/// Everything past this point degrades to the original payload instead.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("data URI has no header/payload separator")]
    MalformedDataUri,
    #[error("data URI header has no parseable MIME type")]
    MalformedMimeHeader,
}

/// Split a data URI into its MIME type and base64 payload.
fn split_data_uri(data_uri: &str) -> Result<(String, &str), MediaError> {
    let (header, payload) = data_uri
        .split_once(',')
        .ok_or(MediaError::MalformedDataUri)?;

    // Header looks like "data:image/png;base64".
    let (_, mime) = header
        .split_once(':')
        .ok_or(MediaError::MalformedMimeHeader)?;
    let mime = mime.split(';').next().unwrap_or(mime);
    if mime.is_empty() {
        return Err(MediaError::MalformedMimeHeader);
    }

    Ok((mime.to_string(), payload.trim()))
}

/// Normalize a data-URI image under the configured byte budget.
///
/// Payloads already within budget are returned byte-identical. Oversized
/// payloads are re-encoded per format; if that fails for any reason the
/// original payload is returned as-is.
pub fn normalize(data_uri: &str, cfg: &MediaConfig) -> Result<NormalizedImage, MediaError> {
    let (media_type, payload) = split_data_uri(data_uri)?;

    let bytes = match BASE64.decode(payload.as_bytes()) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("image payload is not valid base64, passing through unchanged: {err}");
            return Ok(NormalizedImage {
                data: payload.to_string(),
                media_type,
            });
        }
    };

    let budget_kb = cfg.budget_kb as f64;
    if size_kb(&bytes) <= budget_kb {
        return Ok(NormalizedImage {
            data: payload.to_string(),
            media_type,
        });
    }

    match shrink(&bytes, &media_type, cfg) {
        Ok(normalized) => Ok(normalized),
        Err(err) => {
            warn!("image re-encode failed, keeping original payload: {err:#}");
            Ok(NormalizedImage {
                data: payload.to_string(),
                media_type,
            })
        }
    }
}

fn size_kb(bytes: &[u8]) -> f64 {
    bytes.len() as f64 / 1024.0
}

fn is_lossy(media_type: &str) -> bool {
    matches!(media_type, "image/jpeg" | "image/jpg")
}

/// Re-encode an over-budget image.
fn shrink(bytes: &[u8], media_type: &str, cfg: &MediaConfig) -> anyhow::Result<NormalizedImage> {
    let img = image::load_from_memory(bytes)?;

    if is_lossy(media_type) {
        let (encoded, quality) = jpeg_quality_ladder(&img, cfg)?;

        // Still over budget at the floor: scale dimensions once and
        // re-encode at floor quality.
        let encoded = if size_kb(&encoded) > cfg.budget_kb as f64 {
            let factor = (cfg.budget_kb as f64 / size_kb(&encoded)).sqrt();
            let scaled = resize_by(&img, factor);
            encode_jpeg(&scaled, quality)?
        } else {
            encoded
        };

        return Ok(NormalizedImage {
            data: BASE64.encode(&encoded),
            media_type: "image/jpeg".to_string(),
        });
    }

    // Lossless formats are never quality-reduced, only scaled.
    let factor = (cfg.budget_kb as f64 / size_kb(bytes)).sqrt();
    if factor >= 1.0 {
        return Ok(NormalizedImage {
            data: BASE64.encode(bytes),
            media_type: media_type.to_string(),
        });
    }

    let format = ImageFormat::from_mime_type(media_type)
        .ok_or_else(|| anyhow::anyhow!("no encoder for {media_type}"))?;
    let scaled = resize_by(&img, factor);
    let mut buf = Vec::new();
    scaled.write_to(&mut Cursor::new(&mut buf), format)?;

    Ok(NormalizedImage {
        data: BASE64.encode(&buf),
        media_type: media_type.to_string(),
    })
}

/// Re-encode at descending quality until under budget or the floor.
///
/// Returns the last encoding and the quality it used.
fn jpeg_quality_ladder(img: &DynamicImage, cfg: &MediaConfig) -> anyhow::Result<(Vec<u8>, u8)> {
    let mut quality = cfg.jpeg_quality_start;
    loop {
        let encoded = encode_jpeg(img, quality)?;
        if size_kb(&encoded) <= cfg.budget_kb as f64 {
            return Ok((encoded, quality));
        }
        if quality <= cfg.jpeg_quality_floor + cfg.jpeg_quality_step {
            return Ok((encode_jpeg(img, cfg.jpeg_quality_floor)?, cfg.jpeg_quality_floor));
        }
        quality -= cfg.jpeg_quality_step;
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    // JPEG has no alpha channel; flatten before encoding.
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
    Ok(buf)
}

fn resize_by(img: &DynamicImage, factor: f64) -> DynamicImage {
    let width = ((img.width() as f64 * factor) as u32).max(1);
    let height = ((img.height() as f64 * factor) as u32).max(1);
    img.resize_exact(width, height, FilterType::Lanczos3)
}
