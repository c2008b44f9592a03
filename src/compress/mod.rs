//! Image compression pipeline
//!
//! Resizes and re-encodes images before persistence: decode from memory,
//! fit the dimensions inside the configured bounds (never upscaling), resize
//! with a high-quality filter, and re-encode at a size-appropriate quality.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;

use crate::error::{PhotoStorageError, PhotoStorageErrorCode, Result};
use crate::types::PhotoFile;
use crate::util;

const MB: u64 = 1024 * 1024;

/// Target encoding for compressed output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CompressionOptions {
    pub max_width: u32,
    pub max_height: u32,
    /// Encoding quality in 0.0..=1.0; only meaningful for JPEG output
    pub quality: f32,
    pub format: OutputFormat,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1920,
            quality: 0.85,
            format: OutputFormat::Jpeg,
        }
    }
}

/// Result of a compression pass
#[derive(Clone, Debug)]
pub struct CompressedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
}

fn compression_error(
    message: &str,
    cause: impl std::error::Error + Send + Sync + 'static,
) -> PhotoStorageError {
    PhotoStorageError::with_cause(PhotoStorageErrorCode::CompressionFailed, message, cause)
}

/// Compute target dimensions that fit inside the bounds while preserving
/// aspect ratio.
///
/// Dimensions that already fit are returned unchanged (no upscaling).
/// Otherwise the overflowing dimension is scaled to its bound, the other
/// dimension is re-checked, and a second rescale is applied if it still
/// overflows. Results are rounded to whole pixels.
pub fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let mut w = width as f64;
    let mut h = height as f64;

    if w > max_width as f64 {
        h = h * max_width as f64 / w;
        w = max_width as f64;
    }
    if h > max_height as f64 {
        w = w * max_height as f64 / h;
        h = max_height as f64;
    }

    (w.round() as u32, h.round() as u32)
}

/// Whether a file is large enough to be worth compressing
pub fn should_compress(file: &PhotoFile, threshold: u64) -> bool {
    file.size() > threshold
}

/// Size-appropriate quality: larger originals are compressed harder
pub fn optimal_quality(file_size: u64) -> f32 {
    if file_size > 5 * MB {
        0.70
    } else if file_size > 2 * MB {
        0.80
    } else if file_size > MB {
        0.85
    } else {
        0.90
    }
}

/// Rough estimate of the compressed size using a fixed ratio model.
///
/// The real output depends on image content; this is only good enough for
/// quota pre-checks and progress UI.
pub fn estimate_compressed_size(file: &PhotoFile, quality: f32) -> u64 {
    let ratio = 0.15 * quality as f64;
    (file.size() as f64 * ratio) as u64
}

/// Read natural dimensions from the image header without a full decode
pub fn image_dimensions(file: &PhotoFile) -> Result<(u32, u32)> {
    let reader = image::io::Reader::new(Cursor::new(&file.bytes))
        .with_guessed_format()
        .map_err(|e| compression_error("failed to probe image format", e))?;
    reader
        .into_dimensions()
        .map_err(|e| compression_error("failed to read image dimensions", e))
}

fn encode(image: &DynamicImage, options: &CompressionOptions) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    match options.format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel; flatten before encoding.
            let quality = (options.quality.clamp(0.01, 1.0) * 100.0).round() as u8;
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            rgb.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))
                .map_err(|e| compression_error("failed to encode JPEG", e))?;
        }
        OutputFormat::Png => {
            image
                .write_to(&mut cursor, ImageOutputFormat::Png)
                .map_err(|e| compression_error("failed to encode PNG", e))?;
        }
    }
    Ok(cursor.into_inner())
}

/// Run the full compression pipeline on a file
pub fn compress(file: &PhotoFile, options: &CompressionOptions) -> Result<CompressedImage> {
    let image = image::load_from_memory(&file.bytes)
        .map_err(|e| compression_error("failed to decode image", e))?;

    let (width, height) = image.dimensions();
    let (target_width, target_height) =
        fit_dimensions(width, height, options.max_width, options.max_height);

    let resized = if (target_width, target_height) != (width, height) {
        image.resize_exact(target_width, target_height, FilterType::Lanczos3)
    } else {
        image
    };

    let bytes = encode(&resized, options)?;
    Ok(CompressedImage {
        bytes,
        width: target_width,
        height: target_height,
        mime_type: options.format.mime_type().to_string(),
    })
}

/// Same pipeline as [`compress`], emitting a data-URL string
pub fn compress_to_base64(file: &PhotoFile, options: &CompressionOptions) -> Result<String> {
    let compressed = compress(file, options)?;
    Ok(util::encode_data_url(
        &compressed.mime_type,
        &compressed.bytes,
    ))
}
