//! Still frames captured from the camera stream.
//!
//! A frame is ephemeral: it lives for one detection cycle and is owned by
//! whichever component captured it.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};

#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// JPEG-encoded pixels, shared so adapters can hand them to blocking
    /// workers without copying.
    pub jpeg: Arc<Vec<u8>>,
}

impl Frame {
    pub fn from_image(seq: u64, captured_at: DateTime<Utc>, image: &DynamicImage) -> Result<Self> {
        let mut bytes = Vec::new();
        // JPEG has no alpha channel.
        DynamicImage::ImageRgb8(image.to_rgb8())
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .context("failed to encode frame as JPEG")?;

        Ok(Self {
            seq,
            captured_at,
            width: image.width(),
            height: image.height(),
            jpeg: Arc::new(bytes),
        })
    }

    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory_with_format(&self.jpeg, ImageFormat::Jpeg)
            .with_context(|| format!("failed to decode frame {}", self.seq))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.jpeg.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn encodes_and_decodes_dimensions() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 24, Rgb([120, 30, 200])));
        let frame = Frame::from_image(7, Utc::now(), &image).unwrap();

        assert_eq!((frame.width, frame.height), (32, 24));
        assert!(!frame.jpeg.is_empty());

        let decoded = frame.decode().unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn base64_payload_is_standard_alphabet() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let frame = Frame::from_image(0, Utc::now(), &image).unwrap();
        let encoded = frame.to_base64();

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .unwrap();
        assert_eq!(decoded, *frame.jpeg);
    }
}
