//! Skip heuristics, resizing, and fail-open compression.
//!
//! Everything here is synchronous CPU work; the pipeline runs it on the
//! blocking pool.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use thiserror::Error;
use tracing::{debug, warn};

use super::AssetError;
use super::format::{ImageFormat, has_optimizer_marker, png_bit_depth};
use super::metrics::ProcessingOutcome;

/// Default minimum size worth processing (10 KiB).
pub const DEFAULT_MIN_PROCESS_BYTES: usize = 10 * 1024;

/// PNGs at or below this bit depth are treated as already optimized.
pub const DEFAULT_PNG_SKIP_BIT_DEPTH: u8 = 4;

/// Default maximum output width in pixels.
pub const DEFAULT_MAX_WIDTH: u32 = 1920;

/// Default JPEG re-encode quality.
pub const DEFAULT_JPEG_QUALITY: u8 = 82;

/// Lowest JPEG quality the bundled compressor accepts.
pub const MIN_JPEG_QUALITY: u8 = 30;

/// Quality used when re-encoding a resized JPEG before compression.
const RESIZE_JPEG_QUALITY: u8 = 95;

/// Compressor failure. Never fatal to an acquisition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompressError {
    /// Output at acceptable quality could not be produced.
    #[error("quality too low: {0}")]
    QualityTooLow(String),

    /// The compressor failed outright.
    #[error("compression failed: {0}")]
    Failed(String),
}

/// Pluggable image compressor.
pub trait Compressor: Send + Sync {
    /// Returns compressed bytes in the same format.
    ///
    /// # Errors
    ///
    /// Returns [`CompressError`]; callers fall back to the input bytes.
    fn compress(&self, bytes: &[u8], format: ImageFormat) -> Result<Vec<u8>, CompressError>;
}

/// Re-encoding compressor built on the `image` crate.
///
/// PNG is re-encoded with maximum deflate effort, JPEG at a fixed quality,
/// WebP losslessly.
#[derive(Debug, Clone, Copy)]
pub struct ImageCompressor {
    jpeg_quality: u8,
}

impl Default for ImageCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl ImageCompressor {
    /// Creates a compressor with the given JPEG quality (1-100).
    #[must_use]
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.min(100),
        }
    }
}

impl Compressor for ImageCompressor {
    fn compress(&self, bytes: &[u8], format: ImageFormat) -> Result<Vec<u8>, CompressError> {
        if format == ImageFormat::Jpeg && self.jpeg_quality < MIN_JPEG_QUALITY {
            return Err(CompressError::QualityTooLow(format!(
                "JPEG quality {} is below {MIN_JPEG_QUALITY}",
                self.jpeg_quality
            )));
        }

        let image = decode(bytes, format).map_err(CompressError::Failed)?;
        encode(&image, format, self.jpeg_quality).map_err(CompressError::Failed)
    }
}

/// Thresholds applied by [`optimize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingLimits {
    /// Assets smaller than this are persisted unmodified.
    pub min_process_bytes: usize,
    /// PNGs at or below this bit depth are persisted unmodified.
    pub png_skip_bit_depth: u8,
    /// Resizable images wider than this are scaled down.
    pub max_width: u32,
}

impl Default for ProcessingLimits {
    fn default() -> Self {
        Self {
            min_process_bytes: DEFAULT_MIN_PROCESS_BYTES,
            png_skip_bit_depth: DEFAULT_PNG_SKIP_BIT_DEPTH,
            max_width: DEFAULT_MAX_WIDTH,
        }
    }
}

/// Bytes to persist plus how they were produced.
#[derive(Debug, Clone)]
pub struct Optimized {
    /// Final bytes.
    pub bytes: Vec<u8>,
    /// Processing path taken.
    pub outcome: ProcessingOutcome,
    /// True when the compressor failed and the pre-compression bytes were kept.
    pub compression_fallback: bool,
}

impl Optimized {
    fn unmodified(bytes: Vec<u8>, outcome: ProcessingOutcome) -> Self {
        Self {
            bytes,
            outcome,
            compression_fallback: false,
        }
    }
}

/// Applies skip heuristics, resizing, and compression to fetched bytes.
///
/// # Errors
///
/// Returns [`AssetError::Processing`] when a resizable image cannot be decoded
/// or re-encoded for resizing. Compressor failures never error; they fall back
/// to the pre-compression bytes.
pub fn optimize(
    url: &str,
    original: Vec<u8>,
    format: ImageFormat,
    limits: &ProcessingLimits,
    compressor: &dyn Compressor,
) -> Result<Optimized, AssetError> {
    if original.len() < limits.min_process_bytes {
        debug!(url, bytes = original.len(), "below minimum size, skipping processing");
        return Ok(Optimized::unmodified(original, ProcessingOutcome::SkippedTooSmall));
    }

    if has_optimizer_marker(&original) {
        debug!(url, "optimizer marker found, skipping processing");
        return Ok(Optimized::unmodified(
            original,
            ProcessingOutcome::SkippedAlreadyOptimized,
        ));
    }

    if format == ImageFormat::Png
        && png_bit_depth(&original).is_some_and(|depth| depth <= limits.png_skip_bit_depth)
    {
        debug!(url, "low bit depth PNG, skipping processing");
        return Ok(Optimized::unmodified(
            original,
            ProcessingOutcome::SkippedAlreadyOptimized,
        ));
    }

    if !format.is_resizable() {
        return Ok(Optimized::unmodified(original, ProcessingOutcome::Passthrough));
    }

    let (working, outcome) = match resize_to_width(&original, format, limits.max_width)
        .map_err(|reason| AssetError::processing(url, reason))?
    {
        Some(resized) => (resized, ProcessingOutcome::Processed),
        None => (original, ProcessingOutcome::ResizeSkipped),
    };

    match compressor.compress(&working, format) {
        Ok(compressed) if compressed.len() < working.len() => {
            debug!(
                url,
                before = working.len(),
                after = compressed.len(),
                "compressed"
            );
            Ok(Optimized {
                bytes: compressed,
                outcome,
                compression_fallback: false,
            })
        }
        Ok(_) => {
            debug!(url, "compression gave no gain, keeping input");
            Ok(Optimized::unmodified(working, outcome))
        }
        Err(error) => {
            warn!(url, error = %error, "compressor failed, keeping uncompressed bytes");
            Ok(Optimized {
                bytes: working,
                outcome,
                compression_fallback: true,
            })
        }
    }
}

/// Scales an image down to `max_width`, preserving aspect ratio.
///
/// Returns `None` when the image already fits.
fn resize_to_width(
    bytes: &[u8],
    format: ImageFormat,
    max_width: u32,
) -> Result<Option<Vec<u8>>, String> {
    let (width, _height) = ImageReader::with_format(Cursor::new(bytes), codec_format(format)?)
        .into_dimensions()
        .map_err(|e| format!("failed to read dimensions: {e}"))?;
    if width <= max_width {
        return Ok(None);
    }

    let image = decode(bytes, format)?;
    let resized = image.resize(max_width, u32::MAX, FilterType::Lanczos3);
    debug!(
        from_width = width,
        to_width = resized.width(),
        "resized image"
    );
    encode(&resized, format, RESIZE_JPEG_QUALITY).map(Some)
}

fn codec_format(format: ImageFormat) -> Result<image::ImageFormat, String> {
    match format {
        ImageFormat::Png => Ok(image::ImageFormat::Png),
        ImageFormat::Jpeg => Ok(image::ImageFormat::Jpeg),
        ImageFormat::Webp => Ok(image::ImageFormat::WebP),
        ImageFormat::Gif => Ok(image::ImageFormat::Gif),
        ImageFormat::Svg => Err("SVG is not a raster format".to_string()),
    }
}

fn decode(bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, String> {
    image::load_from_memory_with_format(bytes, codec_format(format)?)
        .map_err(|e| format!("decode failed: {e}"))
}

fn encode(image: &DynamicImage, format: ImageFormat, jpeg_quality: u8) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let result = match format {
        ImageFormat::Png => image.write_with_encoder(PngEncoder::new_with_quality(
            &mut buffer,
            CompressionType::Best,
            PngFilterType::Adaptive,
        )),
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, jpeg_quality)),
        ImageFormat::Webp => DynamicImage::ImageRgba8(image.to_rgba8())
            .write_with_encoder(WebPEncoder::new_lossless(&mut buffer)),
        ImageFormat::Gif | ImageFormat::Svg => {
            return Err(format!("cannot encode {format}"));
        }
    };
    result.map_err(|e| format!("encode failed: {e}"))?;
    Ok(buffer)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    struct RefusingCompressor;

    impl Compressor for RefusingCompressor {
        fn compress(&self, _bytes: &[u8], _format: ImageFormat) -> Result<Vec<u8>, CompressError> {
            Err(CompressError::QualityTooLow("refused".to_string()))
        }
    }

    struct HalvingCompressor;

    impl Compressor for HalvingCompressor {
        fn compress(&self, bytes: &[u8], _format: ImageFormat) -> Result<Vec<u8>, CompressError> {
            Ok(bytes[..bytes.len() / 2].to_vec())
        }
    }

    struct GrowingCompressor;

    impl Compressor for GrowingCompressor {
        fn compress(&self, bytes: &[u8], _format: ImageFormat) -> Result<Vec<u8>, CompressError> {
            let mut out = bytes.to_vec();
            out.extend_from_slice(b"padding");
            Ok(out)
        }
    }

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            let v = x.wrapping_mul(31).wrapping_add(y.wrapping_mul(17)).wrapping_mul(2_654_435_761);
            Rgb([(v >> 8) as u8, (v >> 16) as u8, (v >> 24) as u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn limits(min_process_bytes: usize, max_width: u32) -> ProcessingLimits {
        ProcessingLimits {
            min_process_bytes,
            png_skip_bit_depth: DEFAULT_PNG_SKIP_BIT_DEPTH,
            max_width,
        }
    }

    // ==================== Skip Heuristic Tests ====================

    #[test]
    fn test_small_asset_persisted_unmodified() {
        let bytes = noisy_png(4, 4);
        let result = optimize(
            "https://x.test/a.png",
            bytes.clone(),
            ImageFormat::Png,
            &limits(1 << 20, 1920),
            &HalvingCompressor,
        )
        .unwrap();

        assert_eq!(result.bytes, bytes);
        assert_eq!(result.outcome, ProcessingOutcome::SkippedTooSmall);
    }

    #[test]
    fn test_optimizer_marker_skips_processing() {
        let mut bytes = noisy_png(8, 8);
        bytes.extend_from_slice(b"Software: pngquant");
        let result = optimize(
            "https://x.test/a.png",
            bytes.clone(),
            ImageFormat::Png,
            &limits(0, 1920),
            &HalvingCompressor,
        )
        .unwrap();

        assert_eq!(result.bytes, bytes);
        assert_eq!(result.outcome, ProcessingOutcome::SkippedAlreadyOptimized);
    }

    #[test]
    fn test_gif_passes_through() {
        let bytes = b"GIF89a-pretend-gif-body".to_vec();
        let result = optimize(
            "https://x.test/a.gif",
            bytes.clone(),
            ImageFormat::Gif,
            &limits(0, 1920),
            &HalvingCompressor,
        )
        .unwrap();

        assert_eq!(result.bytes, bytes);
        assert_eq!(result.outcome, ProcessingOutcome::Passthrough);
    }

    // ==================== Resize Tests ====================

    #[test]
    fn test_wide_image_resized_to_max_width() {
        let bytes = noisy_png(64, 32);
        let result = optimize(
            "https://x.test/a.png",
            bytes,
            ImageFormat::Png,
            &limits(0, 16),
            &GrowingCompressor,
        )
        .unwrap();

        assert_eq!(result.outcome, ProcessingOutcome::Processed);
        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
    }

    #[test]
    fn test_corrupt_resizable_image_is_processing_error() {
        let mut bytes = noisy_png(8, 8);
        bytes.truncate(20);
        let result = optimize(
            "https://x.test/a.png",
            bytes,
            ImageFormat::Png,
            &limits(0, 1920),
            &HalvingCompressor,
        );

        assert!(matches!(result, Err(AssetError::Processing { .. })));
    }

    // ==================== Compression Tests ====================

    #[test]
    fn test_quality_too_low_keeps_original_bytes() {
        let bytes = noisy_png(16, 16);
        let result = optimize(
            "https://x.test/a.png",
            bytes.clone(),
            ImageFormat::Png,
            &limits(0, 1920),
            &RefusingCompressor,
        )
        .unwrap();

        assert_eq!(result.bytes, bytes);
        assert!(result.compression_fallback);
        assert_eq!(result.outcome, ProcessingOutcome::ResizeSkipped);
    }

    #[test]
    fn test_smaller_output_is_used() {
        let bytes = noisy_png(16, 16);
        let result = optimize(
            "https://x.test/a.png",
            bytes.clone(),
            ImageFormat::Png,
            &limits(0, 1920),
            &HalvingCompressor,
        )
        .unwrap();

        assert_eq!(result.bytes.len(), bytes.len() / 2);
        assert!(!result.compression_fallback);
    }

    #[test]
    fn test_larger_output_keeps_input() {
        let bytes = noisy_png(16, 16);
        let result = optimize(
            "https://x.test/a.png",
            bytes.clone(),
            ImageFormat::Png,
            &limits(0, 1920),
            &GrowingCompressor,
        )
        .unwrap();

        assert_eq!(result.bytes, bytes);
        assert!(!result.compression_fallback);
    }

    #[test]
    fn test_image_compressor_rejects_low_jpeg_quality() {
        let compressor = ImageCompressor::new(10);
        let result = compressor.compress(&[0xFF, 0xD8, 0xFF], ImageFormat::Jpeg);
        assert!(matches!(result, Err(CompressError::QualityTooLow(_))));
    }

    #[test]
    fn test_image_compressor_roundtrips_png() {
        let bytes = noisy_png(16, 16);
        let compressed = ImageCompressor::default()
            .compress(&bytes, ImageFormat::Png)
            .unwrap();
        let decoded = image::load_from_memory(&compressed).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }
}
