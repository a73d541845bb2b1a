use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use tracing::info;

use crate::error::AppError;
use crate::models::{AspectRatio, StoredImage};

/// Chroma-key fill. The generation model is instructed to replace every
/// pixel of this color with new background content.
pub const CHROMA_GREEN: Rgb<u8> = Rgb([0, 255, 0]);

const JPEG_QUALITY: u8 = 95;

/// Pad a decoded image out to the target aspect ratio.
///
/// The canvas is only ever grown to fit the ratio, never shrunk, so the
/// original image is fully preserved without cropping or scaling. Fill is
/// chroma-key green, the source is drawn centered at its natural size, and
/// the result is re-encoded as JPEG.
pub fn pad_to_aspect(source: &DynamicImage, ratio: AspectRatio) -> Result<StoredImage, AppError> {
    let (width, height) = (source.width(), source.height());
    let target = ratio.ratio();
    let image_ratio = width as f64 / height as f64;

    let (canvas_w, canvas_h) = if image_ratio > target {
        (width, (width as f64 / target).round() as u32)
    } else {
        ((height as f64 * target).round() as u32, height)
    };

    let mut canvas = RgbImage::from_pixel(canvas_w, canvas_h, CHROMA_GREEN);
    let x = (canvas_w - width) / 2;
    let y = (canvas_h - height) / 2;
    image::imageops::overlay(&mut canvas, &source.to_rgb8(), i64::from(x), i64::from(y));

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY)
        .encode_image(&canvas)
        .map_err(|e| AppError::Preprocess(format!("could not encode padded image: {e}")))?;

    info!(
        "🖼️ Padded {}x{} source to {}x{} canvas for ratio {}",
        width, height, canvas_w, canvas_h, ratio
    );
    Ok(StoredImage::new(Bytes::from(encoded), "image/jpeg".into()))
}
