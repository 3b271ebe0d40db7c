use image::{imageops::FilterType, RgbImage};
use img_hash::{HashAlg, HasherConfig};

use crate::error::{Result, VariantError};
use crate::fingerprint::Fingerprint;

/// Side length of the hash grid; 16x16 gives a 256-bit fingerprint.
pub const HASH_SIDE: u32 = 16;

/// Edge length of the luma buffer the quality score is measured on.
const QUALITY_GRID: u32 = 64;

#[derive(Debug, Clone)]
pub struct HashOutput {
    pub fingerprint: Fingerprint,
    /// Reliability of the fingerprint, 0..=100.
    pub quality: u8,
}

/// Perceptual hash boundary. Implementations must be deterministic and
/// always return fingerprints of `bits()` length.
pub trait PerceptualHasher: Send + Sync {
    fn hash(&self, img: &RgbImage) -> Result<HashOutput>;
    fn bits(&self) -> u32;
    fn name(&self) -> &'static str;
}

/// DCT-preprocessed mean hash (pHash-style), paired with a gradient-energy quality score.
///
/// Holds the config rather than a built `img_hash::Hasher`: the DCT context
/// inside a hasher is not `Send`, so one is built per call on the worker thread.
pub struct DctHasher {
    hasher: HasherConfig,
}

impl DctHasher {
    pub fn new() -> Self {
        let hasher = HasherConfig::new().hash_alg(HashAlg::Mean).preproc_dct().hash_size(HASH_SIDE, HASH_SIDE);
        Self { hasher }
    }
}

impl Default for DctHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PerceptualHasher for DctHasher {
    fn hash(&self, img: &RgbImage) -> Result<HashOutput> {
        if img.width() == 0 || img.height() == 0 {
            return Err(VariantError::Hash("cannot hash an empty image".into()));
        }
        // img_hash pins its own `image` version, so hand it a buffer of that type.
        let buf = img_hash::image::RgbImage::from_raw(img.width(), img.height(), img.as_raw().clone())
            .ok_or_else(|| VariantError::Hash("pixel buffer does not match dimensions".into()))?;
        let hash = self.hasher.to_hasher().hash_image(&img_hash::image::DynamicImage::ImageRgb8(buf));
        let fingerprint = Fingerprint::from_bytes(hash.as_bytes().to_vec())?;
        if fingerprint.bits() != self.bits() {
            return Err(VariantError::FingerprintLength { left: fingerprint.bits(), right: self.bits() });
        }
        Ok(HashOutput { fingerprint, quality: quality_score(img) })
    }

    fn bits(&self) -> u32 {
        HASH_SIDE * HASH_SIDE
    }

    fn name(&self) -> &'static str {
        "dct-mean-256"
    }
}

/// Gradient energy of a 64x64 luma downsample. Flat or near-flat images score
/// low because their fingerprints are dominated by noise.
pub fn quality_score(img: &RgbImage) -> u8 {
    let luma = image::imageops::grayscale(img);
    let small = image::imageops::resize(&luma, QUALITY_GRID, QUALITY_GRID, FilterType::Triangle);

    let mut gradient_sum: u64 = 0;
    for y in 0..QUALITY_GRID {
        for x in 0..QUALITY_GRID {
            let u = small.get_pixel(x, y).0[0] as i64;
            if y + 1 < QUALITY_GRID {
                let v = small.get_pixel(x, y + 1).0[0] as i64;
                gradient_sum += (((u - v) * 100) / 255).unsigned_abs();
            }
            if x + 1 < QUALITY_GRID {
                let v = small.get_pixel(x + 1, y).0[0] as i64;
                gradient_sum += (((u - v) * 100) / 255).unsigned_abs();
            }
        }
    }
    (gradient_sum / 90).min(100) as u8
}

#[cfg(test)]
pub(crate) fn textured_image(w: u32, h: u32, salt: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| {
        let a = ((x * 7 + y * 3 + salt * 11) % 64) as u8 * 4;
        let b = (((x / 9) ^ (y / 5)) * 37 + salt * 13) as u8;
        let c = if (x / 16 + y / 16 + salt) % 2 == 0 { 230 } else { 20 };
        image::Rgb([a, b, c])
    })
}
