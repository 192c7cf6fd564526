use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig, ImageHash};

/// Perceptual hash of a frame, base64-encoded so it can be compared later
/// without keeping the pixels around.
pub fn compute_phash(image: &DynamicImage) -> String {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();

    hasher.hash_image(image).to_base64()
}

/// Hamming distance between two encoded hashes. Undecodable input compares
/// as maximally different.
pub fn compute_hamming_distance(lhs: &str, rhs: &str) -> u32 {
    let Ok(h1) = ImageHash::<Vec<u8>>::from_base64(lhs) else {
        return u32::MAX;
    };
    let Ok(h2) = ImageHash::<Vec<u8>>::from_base64(rhs) else {
        return u32::MAX;
    };
    h1.dist(&h2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, GrayImage};

    fn gradient(flip: bool) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |x, _| {
            let v = (x * 4) as u8;
            Luma([if flip { 255 - v } else { v }])
        }))
    }

    #[test]
    fn identical_images_have_zero_distance() {
        let a = compute_phash(&gradient(false));
        let b = compute_phash(&gradient(false));
        assert_eq!(compute_hamming_distance(&a, &b), 0);
    }

    #[test]
    fn mirrored_gradient_is_far_away() {
        let a = compute_phash(&gradient(false));
        let b = compute_phash(&gradient(true));
        assert!(compute_hamming_distance(&a, &b) > 8);
    }

    #[test]
    fn garbage_hash_is_maximally_distant() {
        let a = compute_phash(&gradient(false));
        assert_eq!(compute_hamming_distance(&a, "%%%"), u32::MAX);
    }
}
