use image::{ImageFormat, RgbImage};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::EngineCfg;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::hasher::{HashOutput, PerceptualHasher};
use crate::post;
use crate::recipe::{self, RecipeSpec};
use crate::transform::ImageTransform;

/// Fingerprint and quality of the untouched source, fixed for one image run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalRecord {
    pub fingerprint: Fingerprint,
    pub quality: u8,
}

/// Form in which accepted images leave the engine. Fingerprints are always
/// taken from the delivered pixels, so the recorded hash matches the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Raw transform output.
    #[default]
    Raw,
    /// Baseline JPEG at the given quality.
    Jpeg(u8),
}

/// Delivered pixels, plus the encoded bytes when the delivery is encoded.
#[derive(Debug, Clone)]
pub struct Rendition {
    pub image: RgbImage,
    pub encoded: Option<Vec<u8>>,
}

impl Delivery {
    pub fn render(self, pixels: RgbImage) -> Result<Rendition> {
        match self {
            Delivery::Raw => Ok(Rendition { image: pixels, encoded: None }),
            Delivery::Jpeg(quality) => {
                let bytes = post::encode_jpeg(&pixels, quality)?;
                let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg)?.to_rgb8();
                Ok(Rendition { image: decoded, encoded: Some(bytes) })
            }
        }
    }

    /// Renders `pixels` and hashes the result.
    pub fn hash(self, hasher: &dyn PerceptualHasher, pixels: RgbImage) -> Result<(Rendition, HashOutput)> {
        let rendition = self.render(pixels)?;
        let hashed = hasher.hash(&rendition.image)?;
        Ok((rendition, hashed))
    }
}

/// A transformed image that passed both distance checks.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub rendition: Rendition,
    pub recipe: RecipeSpec,
    pub fingerprint: Fingerprint,
    pub quality: u8,
    pub distance_from_original: u32,
    /// `None` while nothing has been accepted yet.
    pub min_distance_to_accepted: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    LowQuality { quality: u8 },
    TooSimilarToOriginal { distance: u32 },
    /// `variant` is the 1-based ordinal of the closest accepted variant.
    TooSimilarToVariant { variant: u32, distance: u32 },
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub recipe: RecipeSpec,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone)]
pub enum Evaluation {
    Accepted(Candidate),
    Rejected(Rejection),
}

/// Outcome of scoring a fingerprint against the current accepted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass { distance_from_original: u32, min_distance_to_accepted: Option<u32> },
    Fail(RejectionReason),
}

/// Pure acceptance decision. Checks quality, then distance from the original,
/// then distance to every accepted fingerprint.
pub fn judge(
    cfg: &EngineCfg,
    fingerprint: &Fingerprint,
    quality: u8,
    original: &Fingerprint,
    accepted: &[Fingerprint],
) -> Result<Verdict> {
    if quality < cfg.min_quality_threshold {
        return Ok(Verdict::Fail(RejectionReason::LowQuality { quality }));
    }
    let distance_from_original = fingerprint.distance(original)?;
    if distance_from_original < cfg.min_distance_from_original {
        return Ok(Verdict::Fail(RejectionReason::TooSimilarToOriginal { distance: distance_from_original }));
    }
    let nearest = fingerprint.nearest(accepted)?;
    if let Some((idx, distance)) = nearest {
        if distance < cfg.min_distance_between_variants {
            return Ok(Verdict::Fail(RejectionReason::TooSimilarToVariant { variant: idx as u32 + 1, distance }));
        }
    }
    Ok(Verdict::Pass { distance_from_original, min_distance_to_accepted: nearest.map(|(_, d)| d) })
}

/// Produces and scores one candidate per call. Implementations never mutate
/// the accepted set; the engine owns it.
pub trait Evaluate {
    fn evaluate(
        &self,
        source: &RgbImage,
        original: &OriginalRecord,
        accepted: &[Fingerprint],
        rng: &mut StdRng,
    ) -> Result<Evaluation>;
}

/// Recipe sampling, the transform and the hasher wired together.
pub struct CandidateEvaluator<'a> {
    cfg: &'a EngineCfg,
    hasher: &'a dyn PerceptualHasher,
    transform: &'a dyn ImageTransform,
    delivery: Delivery,
}

impl<'a> CandidateEvaluator<'a> {
    pub fn new(cfg: &'a EngineCfg, hasher: &'a dyn PerceptualHasher, transform: &'a dyn ImageTransform) -> Self {
        Self { cfg, hasher, transform, delivery: Delivery::Raw }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Renders an already-transformed image for delivery, hashes it and
    /// judges it. Deterministic for a given image and accepted set.
    pub fn score(
        &self,
        image: RgbImage,
        recipe: RecipeSpec,
        original: &OriginalRecord,
        accepted: &[Fingerprint],
    ) -> Result<Evaluation> {
        let (rendition, hashed) = self.delivery.hash(self.hasher, image)?;
        let verdict = judge(self.cfg, &hashed.fingerprint, hashed.quality, &original.fingerprint, accepted)?;
        Ok(match verdict {
            Verdict::Pass { distance_from_original, min_distance_to_accepted } => Evaluation::Accepted(Candidate {
                rendition,
                recipe,
                fingerprint: hashed.fingerprint,
                quality: hashed.quality,
                distance_from_original,
                min_distance_to_accepted,
            }),
            Verdict::Fail(reason) => Evaluation::Rejected(Rejection { recipe, reason }),
        })
    }
}

impl Evaluate for CandidateEvaluator<'_> {
    fn evaluate(
        &self,
        source: &RgbImage,
        original: &OriginalRecord,
        accepted: &[Fingerprint],
        rng: &mut StdRng,
    ) -> Result<Evaluation> {
        let recipe = recipe::sample_any(&self.cfg.recipes_enabled, rng)?;
        let image = self.transform.apply(source, &recipe)?;
        self.score(image, recipe, original, accepted)
    }
}
