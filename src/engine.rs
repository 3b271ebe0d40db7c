//! Per-image acceptance state machine.
//!
//! ```text
//! Initializing ──quality too low──▶ Skipped
//!      │
//!      ▼
//!   Running ──all slots filled──▶ Completed
//!      │  ╲──slots exhausted──▶ PartiallyCompleted
//!      ╰────cancel flag set───▶ Cancelled
//! ```
//!
//! Each variant slot gets its own budget of `max_attempts_per_variant`
//! evaluations; the counter resets whenever a variant is accepted. A slot
//! that runs out of attempts is abandoned and the run moves on to the next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::RgbImage;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::EngineCfg;
use crate::error::{Result, VariantError};
use crate::evaluator::{Delivery, Evaluate, Evaluation, OriginalRecord, RejectionReason, Rendition};
use crate::fingerprint::Fingerprint;
use crate::hasher::PerceptualHasher;
use crate::recipe::RecipeSpec;

/// Cooperative stop signal, checked before each image and each attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedVariant {
    /// 1-based, in acceptance order.
    pub ordinal: u32,
    pub recipe: RecipeSpec,
    pub fingerprint: Fingerprint,
    pub quality: u8,
    pub distance_from_original: u32,
    pub min_distance_to_prior: Option<u32>,
    /// Attempts spent on this slot, including the accepted one.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    LowQuality { quality: u8, threshold: u8 },
    UnreadableImage { detail: String },
    UnsupportedFormat { detail: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::LowQuality { quality, threshold } => write!(f, "quality too low ({quality} < {threshold})"),
            SkipReason::UnreadableImage { detail } => write!(f, "unreadable image: {detail}"),
            SkipReason::UnsupportedFormat { detail } => write!(f, "unsupported format: {detail}"),
        }
    }
}

/// Terminal state of one image run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PartiallyCompleted,
    Skipped { skip: SkipReason },
    Cancelled,
}

impl RunStatus {
    /// False only for runs cut short by cancellation, which a resumed batch redoes.
    pub fn is_settled(&self) -> bool {
        !matches!(self, RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub low_quality: u32,
    pub too_similar_to_original: u32,
    pub too_similar_to_variant: u32,
}

impl RejectionCounts {
    pub fn record(&mut self, reason: &RejectionReason) {
        match reason {
            RejectionReason::LowQuality { .. } => self.low_quality += 1,
            RejectionReason::TooSimilarToOriginal { .. } => self.too_similar_to_original += 1,
            RejectionReason::TooSimilarToVariant { .. } => self.too_similar_to_variant += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.low_quality + self.too_similar_to_original + self.too_similar_to_variant
    }

    pub fn add(&mut self, other: &RejectionCounts) {
        self.low_quality += other.low_quality;
        self.too_similar_to_original += other.too_similar_to_original;
        self.too_similar_to_variant += other.too_similar_to_variant;
    }
}

#[derive(Debug, Clone)]
pub struct ImageRun {
    pub status: RunStatus,
    pub original: Option<OriginalRecord>,
    pub variants: Vec<AcceptedVariant>,
    pub requested: u32,
    pub unmet_slots: u32,
    pub attempts: u32,
    pub rejections: RejectionCounts,
}

impl ImageRun {
    pub fn skipped(requested: u32, skip: SkipReason) -> Self {
        Self {
            status: RunStatus::Skipped { skip },
            original: None,
            variants: Vec::new(),
            requested,
            unmet_slots: 0,
            attempts: 0,
            rejections: RejectionCounts::default(),
        }
    }
}

/// Non-terminal states, plus the terminal one that ends the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Initializing,
    Running { slot: u32, slot_attempts: u32 },
    Finished(RunStatus),
}

/// Invoked once per accepted variant, before the next attempt starts. The
/// rendition is exactly what the variant's fingerprint was taken from.
pub type AcceptSink<'s> = dyn FnMut(&AcceptedVariant, &Rendition) -> Result<()> + 's;

pub struct AcceptanceEngine<'a, E> {
    cfg: &'a EngineCfg,
    hasher: &'a dyn PerceptualHasher,
    evaluator: E,
    delivery: Delivery,
}

struct RunContext {
    original: Option<OriginalRecord>,
    accepted: Vec<Fingerprint>,
    variants: Vec<AcceptedVariant>,
    unmet_slots: u32,
    attempts: u32,
    rejections: RejectionCounts,
}

impl<'a, E: Evaluate> AcceptanceEngine<'a, E> {
    pub fn new(cfg: &'a EngineCfg, hasher: &'a dyn PerceptualHasher, evaluator: E) -> Self {
        Self { cfg, hasher, evaluator, delivery: Delivery::Raw }
    }

    /// Delivery the original is fingerprinted through; should match the evaluator's.
    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Drives one image from `Initializing` to a terminal state.
    pub fn run(
        &self,
        source: &RgbImage,
        rng: &mut StdRng,
        cancel: &CancelFlag,
        on_accept: &mut AcceptSink<'_>,
    ) -> Result<ImageRun> {
        let mut ctx = RunContext {
            original: None,
            accepted: Vec::new(),
            variants: Vec::new(),
            unmet_slots: 0,
            attempts: 0,
            rejections: RejectionCounts::default(),
        };
        let mut state = State::Initializing;
        let status = loop {
            state = match state {
                State::Finished(status) => break status,
                other => self.step(other, source, &mut ctx, rng, cancel, on_accept)?,
            };
        };
        Ok(ImageRun {
            status,
            original: ctx.original,
            variants: ctx.variants,
            requested: self.cfg.variants_per_image,
            unmet_slots: ctx.unmet_slots,
            attempts: ctx.attempts,
            rejections: ctx.rejections,
        })
    }

    fn step(
        &self,
        state: State,
        source: &RgbImage,
        ctx: &mut RunContext,
        rng: &mut StdRng,
        cancel: &CancelFlag,
        on_accept: &mut AcceptSink<'_>,
    ) -> Result<State> {
        let requested = self.cfg.variants_per_image;
        let (slot, slot_attempts) = match state {
            State::Finished(status) => return Ok(State::Finished(status)),
            State::Initializing => {
                let (_, out) = self.delivery.hash(self.hasher, source.clone())?;
                let quality = out.quality;
                ctx.original = Some(OriginalRecord { fingerprint: out.fingerprint, quality });
                if quality < self.cfg.min_quality_threshold {
                    let skip = SkipReason::LowQuality { quality, threshold: self.cfg.min_quality_threshold };
                    return Ok(State::Finished(RunStatus::Skipped { skip }));
                }
                return Ok(State::Running { slot: 1, slot_attempts: 0 });
            }
            State::Running { slot, slot_attempts } => (slot, slot_attempts),
        };

        if slot > requested {
            let done = ctx.variants.len() as u32 == requested;
            return Ok(State::Finished(if done { RunStatus::Completed } else { RunStatus::PartiallyCompleted }));
        }
        if cancel.is_cancelled() {
            return Ok(State::Finished(RunStatus::Cancelled));
        }
        if slot_attempts >= self.cfg.max_attempts_per_variant {
            ctx.unmet_slots += 1;
            debug!(slot, attempts = slot_attempts, "abandoning variant slot");
            if self.cfg.max_failed_slots.is_some_and(|max| ctx.unmet_slots >= max) {
                debug!(unmet = ctx.unmet_slots, "too many abandoned slots, stopping early");
                return Ok(State::Finished(RunStatus::PartiallyCompleted));
            }
            return Ok(State::Running { slot: slot + 1, slot_attempts: 0 });
        }

        let original = ctx
            .original
            .as_ref()
            .ok_or_else(|| VariantError::Hash("running without an original fingerprint".into()))?;
        ctx.attempts += 1;
        match self.evaluator.evaluate(source, original, &ctx.accepted, rng)? {
            Evaluation::Accepted(candidate) => {
                let variant = AcceptedVariant {
                    ordinal: ctx.variants.len() as u32 + 1,
                    recipe: candidate.recipe,
                    fingerprint: candidate.fingerprint,
                    quality: candidate.quality,
                    distance_from_original: candidate.distance_from_original,
                    min_distance_to_prior: candidate.min_distance_to_accepted,
                    attempts: slot_attempts + 1,
                };
                debug!(
                    ordinal = variant.ordinal,
                    recipe = %variant.recipe.family(),
                    distance = variant.distance_from_original,
                    attempts = variant.attempts,
                    "variant accepted"
                );
                on_accept(&variant, &candidate.rendition)?;
                ctx.accepted.push(variant.fingerprint.clone());
                ctx.variants.push(variant);
                Ok(State::Running { slot: slot + 1, slot_attempts: 0 })
            }
            Evaluation::Rejected(rejection) => {
                trace!(slot, attempt = slot_attempts + 1, recipe = %rejection.recipe.family(), reason = ?rejection.reason, "candidate rejected");
                ctx.rejections.record(&rejection.reason);
                Ok(State::Running { slot, slot_attempts: slot_attempts + 1 })
            }
        }
    }
}

/// Re-checks both distance invariants over a whole accepted sequence.
pub fn audit<'f>(
    image: &str,
    cfg: &EngineCfg,
    original: &Fingerprint,
    variants: impl IntoIterator<Item = &'f Fingerprint>,
) -> Result<()> {
    let variants: Vec<&Fingerprint> = variants.into_iter().collect();
    for (i, v) in variants.iter().enumerate() {
        let d = v.distance(original)?;
        if d < cfg.min_distance_from_original {
            return Err(VariantError::InvariantViolation {
                image: image.to_string(),
                detail: format!(
                    "variant {} is {d} bits from the original, minimum is {}",
                    i + 1,
                    cfg.min_distance_from_original
                ),
            });
        }
        for (j, w) in variants.iter().enumerate().skip(i + 1) {
            let d = v.distance(w)?;
            if d < cfg.min_distance_between_variants {
                return Err(VariantError::InvariantViolation {
                    image: image.to_string(),
                    detail: format!(
                        "variants {} and {} are {d} bits apart, minimum is {}",
                        i + 1,
                        j + 1,
                        cfg.min_distance_between_variants
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{CandidateEvaluator, Rejection};
    use crate::fingerprint::with_bits;
    use crate::hasher::{textured_image, DctHasher, HashOutput};
    use crate::recipe::RecipeFamily;
    use crate::transform::GeometricTransform;
    use rand::SeedableRng;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns scripted outputs in order, regardless of the image.
    struct ScriptedHasher(Mutex<VecDeque<HashOutput>>);

    impl ScriptedHasher {
        fn new(outputs: impl IntoIterator<Item = (Fingerprint, u8)>) -> Self {
            let q = outputs.into_iter().map(|(fingerprint, quality)| HashOutput { fingerprint, quality }).collect();
            Self(Mutex::new(q))
        }
    }

    impl PerceptualHasher for ScriptedHasher {
        fn hash(&self, _img: &RgbImage) -> Result<HashOutput> {
            self.0.lock().unwrap().pop_front().ok_or_else(|| VariantError::Hash("script exhausted".into()))
        }
        fn bits(&self) -> u32 {
            256
        }
        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Identity transform so scripted hashes drive every decision.
    struct Identity;

    impl crate::transform::ImageTransform for Identity {
        fn apply(&self, img: &RgbImage, _recipe: &RecipeSpec) -> Result<RgbImage> {
            Ok(img.clone())
        }
    }

    struct AlwaysReject;

    impl Evaluate for AlwaysReject {
        fn evaluate(&self, _: &RgbImage, _: &OriginalRecord, _: &[Fingerprint], _: &mut StdRng) -> Result<Evaluation> {
            Ok(Evaluation::Rejected(Rejection {
                recipe: RecipeSpec::MicroCrop { fraction: 0.05 },
                reason: RejectionReason::TooSimilarToOriginal { distance: 0 },
            }))
        }
    }

    fn source() -> RgbImage {
        textured_image(32, 32, 0)
    }

    fn run_with<E: Evaluate>(cfg: &EngineCfg, hasher: &dyn PerceptualHasher, evaluator: E) -> (ImageRun, Vec<u32>) {
        let engine = AcceptanceEngine::new(cfg, hasher, evaluator);
        let mut seen = Vec::new();
        let mut rng = StdRng::seed_from_u64(1);
        let run = engine
            .run(&source(), &mut rng, &CancelFlag::new(), &mut |v: &AcceptedVariant, _: &Rendition| {
                seen.push(v.ordinal);
                Ok(())
            })
            .unwrap();
        (run, seen)
    }

    #[test]
    fn low_quality_source_is_skipped_without_attempts() {
        let cfg = EngineCfg::default();
        let hasher = ScriptedHasher::new([(with_bits(256, []), 40)]);
        let (run, seen) = run_with(&cfg, &hasher, AlwaysReject);
        assert_eq!(run.status, RunStatus::Skipped { skip: SkipReason::LowQuality { quality: 40, threshold: 50 } });
        assert_eq!(run.attempts, 0);
        assert!(run.variants.is_empty());
        assert!(seen.is_empty());
    }

    #[test]
    fn always_rejecting_evaluator_terminates_partially() {
        let cfg = EngineCfg { variants_per_image: 4, max_attempts_per_variant: 1, ..EngineCfg::default() };
        let hasher = ScriptedHasher::new([(with_bits(256, []), 90)]);
        let (run, _) = run_with(&cfg, &hasher, AlwaysReject);
        assert_eq!(run.status, RunStatus::PartiallyCompleted);
        assert!(run.variants.is_empty());
        assert_eq!(run.unmet_slots, 4);
        assert_eq!(run.attempts, 4);
        assert_eq!(run.rejections.too_similar_to_original, 4);
    }

    #[test]
    fn failed_slot_limit_stops_early() {
        let cfg = EngineCfg {
            variants_per_image: 10,
            max_attempts_per_variant: 2,
            max_failed_slots: Some(3),
            ..EngineCfg::default()
        };
        let hasher = ScriptedHasher::new([(with_bits(256, []), 90)]);
        let (run, _) = run_with(&cfg, &hasher, AlwaysReject);
        assert_eq!(run.status, RunStatus::PartiallyCompleted);
        assert_eq!(run.unmet_slots, 3);
        assert_eq!(run.attempts, 6);
    }

    #[test]
    fn rejections_are_classified_in_order() {
        let cfg = EngineCfg {
            variants_per_image: 2,
            max_attempts_per_variant: 2,
            recipes_enabled: vec![RecipeFamily::MicroCrop],
            ..EngineCfg::default()
        };
        let hasher = ScriptedHasher::new([
            (with_bits(256, []), 90),
            (with_bits(256, 0..10), 90),
            (with_bits(256, 0..40), 90),
            (with_bits(256, (0..35).chain(40..50)), 90),
            (with_bits(256, 0..5), 20),
        ]);
        let evaluator = CandidateEvaluator::new(&cfg, &hasher, &Identity);
        let (run, seen) = run_with(&cfg, &hasher, evaluator);

        assert_eq!(run.status, RunStatus::PartiallyCompleted);
        assert_eq!(run.variants.len(), 1);
        assert_eq!(seen, vec![1]);
        assert_eq!(run.variants[0].distance_from_original, 40);
        assert_eq!(run.variants[0].attempts, 2);
        assert_eq!(run.variants[0].min_distance_to_prior, None);
        assert_eq!(
            run.rejections,
            RejectionCounts { low_quality: 1, too_similar_to_original: 1, too_similar_to_variant: 1 }
        );
        assert_eq!(run.unmet_slots, 1);
        assert_eq!(run.attempts, 4);
    }

    #[test]
    fn distinctive_candidates_complete_exactly() {
        let cfg = EngineCfg { variants_per_image: 3, ..EngineCfg::default() };
        let hasher = ScriptedHasher::new([
            (with_bits(256, []), 90),
            (with_bits(256, 0..64), 90),
            (with_bits(256, 64..128), 90),
            (with_bits(256, 128..192), 90),
        ]);
        let evaluator = CandidateEvaluator::new(&cfg, &hasher, &Identity);
        let (run, seen) = run_with(&cfg, &hasher, evaluator);

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(run.variants[1].min_distance_to_prior, Some(128));
        assert_eq!(run.variants[2].min_distance_to_prior, Some(128));
        assert_eq!(run.attempts, 3);
    }

    #[test]
    fn cancellation_stops_between_attempts() {
        let cfg = EngineCfg::default();
        let hasher = ScriptedHasher::new([(with_bits(256, []), 90)]);
        let engine = AcceptanceEngine::new(&cfg, &hasher, AlwaysReject);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut rng = StdRng::seed_from_u64(0);
        let run = engine.run(&source(), &mut rng, &cancel, &mut |_: &AcceptedVariant, _: &Rendition| Ok(())).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.attempts, 0);
    }

    #[test]
    fn sink_errors_are_fatal() {
        let cfg = EngineCfg { variants_per_image: 1, ..EngineCfg::default() };
        let hasher = ScriptedHasher::new([(with_bits(256, []), 90), (with_bits(256, 0..64), 90)]);
        let evaluator = CandidateEvaluator::new(&cfg, &hasher, &Identity);
        let engine = AcceptanceEngine::new(&cfg, &hasher, evaluator);
        let mut rng = StdRng::seed_from_u64(0);
        let result = engine.run(&source(), &mut rng, &CancelFlag::new(), &mut |_: &AcceptedVariant, _: &Rendition| {
            Err(VariantError::io("out/x.jpg", std::io::Error::other("disk full")))
        });
        assert!(matches!(result, Err(VariantError::Io { .. })));
    }

    #[test]
    fn real_pipeline_upholds_both_invariants() {
        let cfg = EngineCfg {
            variants_per_image: 4,
            min_distance_from_original: 16,
            min_distance_between_variants: 8,
            max_attempts_per_variant: 60,
            min_quality_threshold: 0,
            ..EngineCfg::default()
        };
        let hasher = DctHasher::new();
        let transform = GeometricTransform;
        let evaluator = CandidateEvaluator::new(&cfg, &hasher, &transform);
        let engine = AcceptanceEngine::new(&cfg, &hasher, evaluator);
        let img = textured_image(96, 96, 9);
        let mut rng = StdRng::seed_from_u64(2024);
        let run = engine.run(&img, &mut rng, &CancelFlag::new(), &mut |_: &AcceptedVariant, _: &Rendition| Ok(())).unwrap();

        assert!(matches!(run.status, RunStatus::Completed | RunStatus::PartiallyCompleted));
        assert!(run.attempts as u64 <= cfg.max_total_attempts());
        assert_eq!(run.variants.len() as u32 + run.unmet_slots, cfg.variants_per_image);
        let original = &run.original.as_ref().unwrap().fingerprint;
        audit("textured", &cfg, original, run.variants.iter().map(|v| &v.fingerprint)).unwrap();
    }

    #[test]
    fn audit_catches_close_pairs() {
        let cfg = EngineCfg::default();
        let original = with_bits(256, []);
        let variants = [with_bits(256, 0..40), with_bits(256, 100..150), with_bits(256, 0..45)];
        match audit("img.jpg", &cfg, &original, variants.iter()) {
            Err(VariantError::InvariantViolation { image, detail }) => {
                assert_eq!(image, "img.jpg");
                assert!(detail.contains("variants 1 and 3"), "{detail}");
            }
            other => panic!("expected invariant violation, got {other:?}"),
        }
        assert!(audit("img.jpg", &cfg, &original, variants[..2].iter()).is_ok());
    }
}
