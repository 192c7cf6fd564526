//! Face descriptors.
//!
//! The detection/embedding network is an external collaborator; anything
//! that can turn an image into boxed descriptors plugs in through
//! [`FaceEmbedder`].

use anyhow::Result;
use image::{imageops::FilterType, DynamicImage};

use crate::models::BoundingBox;

pub type Descriptor = Vec<f32>;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    pub descriptor: Descriptor,
}

pub trait FaceEmbedder: Send + Sync {
    /// Detect faces and compute one descriptor per face, most prominent first.
    fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

/// Euclidean distance; vectors of different length never match.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Baseline descriptor for pre-cropped face images: the whole image is one
/// face, reduced to a mean-centred, unit-length grid of luminance values.
pub struct GrayscaleEmbedder {
    side: u32,
}

impl Default for GrayscaleEmbedder {
    fn default() -> Self {
        Self { side: 16 }
    }
}

impl GrayscaleEmbedder {
    pub fn new(side: u32) -> Self {
        Self { side: side.max(2) }
    }
}

impl FaceEmbedder for GrayscaleEmbedder {
    fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let gray = image
            .resize_exact(self.side, self.side, FilterType::Triangle)
            .to_luma8();
        let values: Vec<f32> = gray.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let centred: Vec<f32> = values.iter().map(|v| v - mean).collect();
        let norm = centred.iter().map(|v| v * v).sum::<f32>().sqrt();

        // A flat image has no structure to describe.
        if norm <= f32::EPSILON {
            return Ok(Vec::new());
        }

        Ok(vec![DetectedFace {
            bounding_box: BoundingBox::new(0, 0, image.width(), image.height()),
            descriptor: centred.into_iter().map(|v| v / norm).collect(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn distance_of_mismatched_lengths_is_infinite() {
        assert_eq!(euclidean_distance(&[0.0], &[0.0, 1.0]), f32::INFINITY);
        assert_eq!(euclidean_distance(&[3.0, 0.0], &[0.0, 4.0]), 5.0);
    }

    #[test]
    fn flat_image_has_no_face() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 20, Luma([128])));
        assert!(GrayscaleEmbedder::default().detect_faces(&image).unwrap().is_empty());
    }

    #[test]
    fn descriptor_is_unit_length_and_scale_invariant() {
        let small = DynamicImage::ImageLuma8(GrayImage::from_fn(32, 32, |x, y| Luma([((x + y) * 4) as u8])));
        let large = small.resize_exact(64, 64, FilterType::Triangle);
        let embedder = GrayscaleEmbedder::default();

        let a = &embedder.detect_faces(&small).unwrap()[0];
        let b = &embedder.detect_faces(&large).unwrap()[0];

        let norm: f32 = a.descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(euclidean_distance(&a.descriptor, &b.descriptor) < 0.1);
        assert_eq!(a.bounding_box, BoundingBox::new(0, 0, 32, 32));
    }
}
