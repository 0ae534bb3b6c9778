//! Byte-in/byte-out image operations. No I/O, no suspension points.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;

use crate::models::job::{OutputFormat, ResizeFit, ToolOptions};
use crate::services::watermark;

pub const DEFAULT_QUALITY: u8 = 80;

/// Largest edge a resize may request.
pub const MAX_DIMENSION: u32 = 10_000;

/// Encoded output of a transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub bytes: Bytes,
    pub format: OutputFormat,
}

impl Transformed {
    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }
}

/// Quality default plus clamp to [1, 100].
pub fn clamp_quality(quality: Option<i32>) -> u8 {
    quality
        .map(|q| q.clamp(1, 100) as u8)
        .unwrap_or(DEFAULT_QUALITY)
}

/// Run one tool over `input`, watermarking before encode when asked.
///
/// For background removal `input` is the provider's output; this step only
/// re-encodes it to the requested format.
pub fn run_tool(
    options: &ToolOptions,
    input: &[u8],
    apply_watermark: bool,
) -> Result<Transformed, TransformError> {
    let img = decode(input)?;
    let source_format = detect_format(input);

    let (img, format, quality) = match *options {
        ToolOptions::Resize { width, height, fit } => {
            let resized = resize(&img, width, height, fit)?;
            (resized, source_format, DEFAULT_QUALITY)
        }
        ToolOptions::Compress { quality } => (img, source_format, clamp_quality(quality)),
        ToolOptions::Convert { format, quality } => (img, format, clamp_quality(quality)),
        ToolOptions::BackgroundRemove { output_format } => (img, output_format, DEFAULT_QUALITY),
    };

    let img = if apply_watermark {
        watermark::apply(img)
    } else {
        img
    };

    let bytes = encode(&img, format, quality)?;
    Ok(Transformed { bytes, format })
}

pub fn decode(input: &[u8]) -> Result<DynamicImage, TransformError> {
    let reader = ImageReader::new(Cursor::new(input)).with_guessed_format()?;
    if reader.format().is_none() {
        return Err(TransformError::Unsupported(
            "unrecognized image format".to_string(),
        ));
    }
    reader.decode().map_err(TransformError::Decode)
}

/// Format to keep when the tool does not choose one. Anything we cannot
/// encode back falls through to PNG.
pub fn detect_format(input: &[u8]) -> OutputFormat {
    match image::guess_format(input) {
        Ok(image::ImageFormat::Jpeg) => OutputFormat::Jpeg,
        Ok(image::ImageFormat::WebP) => OutputFormat::Webp,
        _ => OutputFormat::Png,
    }
}

fn resize(
    img: &DynamicImage,
    width: Option<u32>,
    height: Option<u32>,
    fit: ResizeFit,
) -> Result<DynamicImage, TransformError> {
    let (src_w, src_h) = img.dimensions();
    let (w, h) = match (width, height) {
        (None, None) => {
            return Err(TransformError::InvalidOptions(
                "resize requires width or height".to_string(),
            ))
        }
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scale(src_h, w, src_w)),
        (None, Some(h)) => (scale(src_w, h, src_h), h),
    };

    if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
        return Err(TransformError::InvalidOptions(format!(
            "resize dimensions must be within 1..={} (got {}x{})",
            MAX_DIMENSION, w, h
        )));
    }

    Ok(match fit {
        ResizeFit::Contain => img.resize(w, h, FilterType::Lanczos3),
        ResizeFit::Cover => img.resize_to_fill(w, h, FilterType::Lanczos3),
        ResizeFit::Fill => img.resize_exact(w, h, FilterType::Lanczos3),
    })
}

/// `value * target / reference`, rounded, at least 1.
fn scale(value: u32, target: u32, reference: u32) -> u32 {
    if reference == 0 {
        return 1;
    }
    let scaled = (value as u64 * target as u64 + reference as u64 / 2) / reference as u64;
    scaled.clamp(1, u32::MAX as u64) as u32
}

pub fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Bytes, TransformError> {
    let (width, height) = img.dimensions();
    let mut buffer = Vec::with_capacity((width * height * 3) as usize / 4);

    match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
            rgb.write_with_encoder(encoder).map_err(TransformError::Encode)?;
        }
        OutputFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut buffer,
                CompressionType::Best,
                PngFilter::Adaptive,
            );
            img.write_with_encoder(encoder).map_err(TransformError::Encode)?;
        }
        OutputFormat::Webp => {
            // The bundled encoder is lossless only; quality does not apply.
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            let encoder = WebPEncoder::new_lossless(&mut buffer);
            rgba.write_with_encoder(encoder).map_err(TransformError::Encode)?;
        }
    }

    Ok(Bytes::from(buffer))
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("failed to decode image: {0}")]
    Decode(image::ImageError),

    #[error("failed to encode image: {0}")]
    Encode(image::ImageError),

    #[error("unsupported image: {0}")]
    Unsupported(String),

    #[error("invalid transform options: {0}")]
    InvalidOptions(String),

    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

impl TransformError {
    /// Failures caused by the submitted image or options rather than by us.
    pub fn is_input_error(&self) -> bool {
        !matches!(self, TransformError::Encode(_))
    }
}
