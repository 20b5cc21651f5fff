//! Image compression and thumbnails.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Longest side of generated thumbnails.
pub const THUMBNAIL_SIZE: u32 = 512;

/// Shrink an image to fit within `max_dimensions`, preserving aspect ratio.
///
/// With `quality` the result is JPEG at that quality, otherwise PNG.
/// Returns `None` when the input cannot be decoded or encoded.
pub fn compress(bytes: &[u8], max_dimensions: (u32, u32), quality: Option<u8>) -> Option<Vec<u8>> {
    let img = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            tracing::warn!("Failed to decode image for compression: {}", e);
            return None;
        }
    };

    let (max_w, max_h) = max_dimensions;
    let img = if img.width() > max_w || img.height() > max_h {
        img.resize(max_w, max_h, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };

    match encode(&img, quality) {
        Ok(out) => Some(out),
        Err(e) => {
            tracing::warn!("Failed to encode compressed image: {}", e);
            None
        }
    }
}

fn encode(img: &DynamicImage, quality: Option<u8>) -> image::ImageResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    match quality {
        Some(q) => {
            let encoder = JpegEncoder::new_with_quality(&mut out, q.clamp(1, 100));
            DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
        }
        None => img.write_to(&mut out, ImageFormat::Png)?,
    }
    Ok(out.into_inner())
}

/// PNG thumbnail that fits in a `THUMBNAIL_SIZE` square.
pub fn thumbnail(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let thumb = img.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE);
    Ok(encode(&thumb, None)?)
}

#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_fits_box_and_keeps_aspect() {
        let png = test_png(400, 200);
        let out = compress(&png, (100, 100), Some(85)).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!((img.width(), img.height()), (100, 50));
    }

    #[test]
    fn test_compress_small_image_keeps_size() {
        let png = test_png(40, 30);
        let out = compress(&png, (100, 100), None).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!((img.width(), img.height()), (40, 30));
    }

    #[test]
    fn test_compress_rejects_garbage() {
        assert!(compress(b"not an image", (100, 100), Some(85)).is_none());
    }

    #[test]
    fn test_thumbnail() {
        let png = test_png(1024, 768);
        let thumb = thumbnail(&png).unwrap();
        let img = image::load_from_memory(&thumb).unwrap();
        assert_eq!(img.width(), THUMBNAIL_SIZE);
        assert_eq!(img.height(), 384);
        assert!(thumbnail(b"junk").is_err());
    }
}
