use std::fmt;
use std::str::FromStr;

use rand::{seq::IndexedRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VariantError};

/// Transform families a recipe can be drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeFamily {
    MicroCrop,
    MicroRotate,
    MicroPerspective,
    CropRotate,
    AsymmetricCrop,
    ScaleShift,
    ColorNoise,
}

impl RecipeFamily {
    pub const ALL: [RecipeFamily; 7] = [
        RecipeFamily::MicroCrop,
        RecipeFamily::MicroRotate,
        RecipeFamily::MicroPerspective,
        RecipeFamily::CropRotate,
        RecipeFamily::AsymmetricCrop,
        RecipeFamily::ScaleShift,
        RecipeFamily::ColorNoise,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RecipeFamily::MicroCrop => "micro_crop",
            RecipeFamily::MicroRotate => "micro_rotate",
            RecipeFamily::MicroPerspective => "micro_perspective",
            RecipeFamily::CropRotate => "crop_rotate",
            RecipeFamily::AsymmetricCrop => "asymmetric_crop",
            RecipeFamily::ScaleShift => "scale_shift",
            RecipeFamily::ColorNoise => "color_noise",
        }
    }

    /// Human-readable parameter ranges, for `varigen recipes`.
    pub fn describe(self) -> &'static str {
        match self {
            RecipeFamily::MicroCrop => "centred crop of 2-8% per axis, resized back",
            RecipeFamily::MicroRotate => "rotation of -4..4 degrees, corners trimmed",
            RecipeFamily::MicroPerspective => "corner inset of 0-5% each, warped to full frame",
            RecipeFamily::CropRotate => "crop of 2-6% plus rotation of -3..3 degrees",
            RecipeFamily::AsymmetricCrop => "independent 0-8% crop per edge",
            RecipeFamily::ScaleShift => "zoom of 2-8% with a -3..3% offset",
            RecipeFamily::ColorNoise => "brightness -12..12, contrast -6..6, gaussian noise sigma 1-4",
        }
    }
}

impl fmt::Display for RecipeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecipeFamily {
    type Err = VariantError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().replace('-', "_").to_ascii_lowercase();
        RecipeFamily::ALL
            .into_iter()
            .find(|f| f.name() == wanted)
            .ok_or_else(|| {
                let known: Vec<_> = RecipeFamily::ALL.iter().map(|f| f.name()).collect();
                VariantError::Config(format!("unknown recipe '{s}', expected one of: {}", known.join(", ")))
            })
    }
}

/// One concrete parameter draw for a family. Fractions are relative to the
/// image dimension they apply to; angles are in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum RecipeSpec {
    MicroCrop { fraction: f32 },
    MicroRotate { degrees: f32 },
    MicroPerspective { insets: [[f32; 2]; 4] },
    CropRotate { fraction: f32, degrees: f32 },
    AsymmetricCrop { left: f32, right: f32, top: f32, bottom: f32 },
    ScaleShift { scale: f32, shift_x: f32, shift_y: f32 },
    ColorNoise { brightness: i32, contrast: f32, noise_sigma: f32, noise_seed: u64 },
}

impl RecipeSpec {
    pub fn family(&self) -> RecipeFamily {
        match self {
            RecipeSpec::MicroCrop { .. } => RecipeFamily::MicroCrop,
            RecipeSpec::MicroRotate { .. } => RecipeFamily::MicroRotate,
            RecipeSpec::MicroPerspective { .. } => RecipeFamily::MicroPerspective,
            RecipeSpec::CropRotate { .. } => RecipeFamily::CropRotate,
            RecipeSpec::AsymmetricCrop { .. } => RecipeFamily::AsymmetricCrop,
            RecipeSpec::ScaleShift { .. } => RecipeFamily::ScaleShift,
            RecipeSpec::ColorNoise { .. } => RecipeFamily::ColorNoise,
        }
    }
}

/// Draws a fresh parameter set for `family`. Every call is independent.
pub fn sample<R: Rng + ?Sized>(family: RecipeFamily, rng: &mut R) -> RecipeSpec {
    match family {
        RecipeFamily::MicroCrop => RecipeSpec::MicroCrop { fraction: rng.random_range(0.02..=0.08) },
        RecipeFamily::MicroRotate => RecipeSpec::MicroRotate { degrees: signed_angle(rng, 0.5, 4.0) },
        RecipeFamily::MicroPerspective => {
            let mut insets = [[0.0f32; 2]; 4];
            for corner in insets.iter_mut() {
                *corner = [rng.random_range(0.0..=0.05), rng.random_range(0.0..=0.05)];
            }
            RecipeSpec::MicroPerspective { insets }
        }
        RecipeFamily::CropRotate => RecipeSpec::CropRotate {
            fraction: rng.random_range(0.02..=0.06),
            degrees: signed_angle(rng, 0.5, 3.0),
        },
        RecipeFamily::AsymmetricCrop => RecipeSpec::AsymmetricCrop {
            left: rng.random_range(0.0..=0.08),
            right: rng.random_range(0.0..=0.08),
            top: rng.random_range(0.0..=0.08),
            bottom: rng.random_range(0.0..=0.08),
        },
        RecipeFamily::ScaleShift => RecipeSpec::ScaleShift {
            scale: rng.random_range(1.02..=1.08),
            shift_x: rng.random_range(-0.03..=0.03),
            shift_y: rng.random_range(-0.03..=0.03),
        },
        RecipeFamily::ColorNoise => RecipeSpec::ColorNoise {
            brightness: rng.random_range(-12..=12),
            contrast: rng.random_range(-6.0..=6.0),
            noise_sigma: rng.random_range(1.0..=4.0),
            noise_seed: rng.random(),
        },
    }
}

/// Picks a family uniformly from `enabled` and samples it.
pub fn sample_any<R: Rng + ?Sized>(enabled: &[RecipeFamily], rng: &mut R) -> Result<RecipeSpec> {
    let family = enabled
        .choose(rng)
        .copied()
        .ok_or_else(|| VariantError::Config("no recipe families enabled".into()))?;
    Ok(sample(family, rng))
}

// Magnitude in [min, max] with a random sign; near-zero rotations do nothing useful.
fn signed_angle<R: Rng + ?Sized>(rng: &mut R, min: f32, max: f32) -> f32 {
    let magnitude = rng.random_range(min..=max);
    if rng.random_bool(0.5) { magnitude } else { -magnitude }
}
