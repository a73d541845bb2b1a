use bytes::Bytes;
use tracing::info;

use crate::error::AppError;
use crate::models::StoredImage;

/// Turn a raw uploaded file into a [`StoredImage`].
///
/// The media type is sniffed from the payload's magic bytes, not the
/// client-declared content type; anything that is not an image is rejected
/// before it can reach the generation pipeline.
pub fn ingest(bytes: Bytes) -> Result<StoredImage, AppError> {
    if bytes.is_empty() {
        return Err(AppError::InvalidInput("the uploaded file is empty".into()));
    }
    let format = image::guess_format(&bytes)
        .map_err(|_| AppError::InvalidInput("the selected file is not an image".into()))?;
    let mime_type = format.to_mime_type().to_string();
    let stored = StoredImage::new(bytes, mime_type);
    info!(
        "📷 Ingested {} image ({} bytes), preview {}",
        stored.mime_type,
        stored.bytes.len(),
        stored.id
    );
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use image::{Rgb, RgbImage};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn png_fixture() -> Bytes {
        let img = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        Bytes::from(buf.into_inner())
    }

    #[test]
    fn ingest_accepts_png_and_encodes_base64() {
        let bytes = png_fixture();
        let stored = ingest(bytes.clone()).unwrap();
        assert_eq!(stored.mime_type, "image/png");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&stored.base64)
            .unwrap();
        assert_eq!(decoded, bytes.to_vec());
    }

    #[test]
    fn ingest_rejects_non_image_payload() {
        let err = ingest(Bytes::from_static(b"%PDF-1.4 not an image")).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn ingest_rejects_empty_payload() {
        let err = ingest(Bytes::new()).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }
}
