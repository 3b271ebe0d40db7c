use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};
use sha2::{Digest, Sha256};
use tokio::{sync::{mpsc, Semaphore}, task::JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::config::RunCfg;
use crate::engine::{AcceptanceEngine, AcceptedVariant, CancelFlag, ImageRun, RunStatus, SkipReason};
use crate::error::{Result, VariantError};
use crate::evaluator::{CandidateEvaluator, Delivery, Rendition};
use crate::hasher::PerceptualHasher;
use crate::io;
use crate::manifest::ImageRecord;
use crate::post;
use crate::transform::ImageTransform;

/// Sources smaller than this on either side are skipped rather than transformed.
pub const MIN_SOURCE_SIDE: u32 = 16;

const LARGE_INPUT_BYTES: u64 = 10 * 1024 * 1024;

/// Shared, read-only state for one batch run.
#[derive(Clone)]
pub struct BatchContext {
    pub cfg: Arc<RunCfg>,
    pub hasher: Arc<dyn PerceptualHasher>,
    pub transform: Arc<dyn ImageTransform>,
    pub cancel: CancelFlag,
    pub base_seed: u64,
    /// Records carried over from an earlier journal, keyed by file name.
    pub resumed: Arc<BTreeMap<String, ImageRecord>>,
}

#[derive(Debug, Clone)]
pub struct ImageReport {
    /// Position of the source in the input listing.
    pub index: usize,
    pub source: PathBuf,
    /// True when the record came from the journal instead of a fresh run.
    pub resumed: bool,
    pub record: ImageRecord,
}

/// Starts processing `images` and yields one report per image as it finishes
/// (completion order, not input order). A fatal error is yielded once and
/// cancels whatever has not started yet.
pub fn run_batch(ctx: BatchContext, images: Vec<PathBuf>) -> ReceiverStream<Result<ImageReport>> {
    let (tx, rx) = mpsc::channel(ctx.cfg.batch.concurrency.max(1) * 2);
    tokio::spawn(drive(ctx, images, tx));
    ReceiverStream::new(rx)
}

async fn drive(ctx: BatchContext, images: Vec<PathBuf>, tx: mpsc::Sender<Result<ImageReport>>) {
    let sem = Arc::new(Semaphore::new(ctx.cfg.batch.concurrency.max(1)));
    let mut joinset = JoinSet::new();

    for (index, path) in images.into_iter().enumerate() {
        let Ok(permit) = sem.clone().acquire_owned().await else { break };
        if ctx.cancel.is_cancelled() {
            info!(remaining_from = index, "batch cancelled, not scheduling further images");
            break;
        }
        let ctx = ctx.clone();
        let tx = tx.clone();

        joinset.spawn(async move {
            let _permit = permit;
            let cancel = ctx.cancel.clone();
            let source = path.clone();
            let item = match tokio::task::spawn_blocking(move || process_image(&ctx, index, &path)).await {
                Ok(item) => item,
                Err(e) => Err(VariantError::at_image(source, VariantError::Worker(e.to_string()))),
            };
            if item.is_err() {
                cancel.cancel();
            }
            let _ = tx.send(item).await;
        });
    }

    while joinset.join_next().await.is_some() {}
}

/// Runs one image to completion. Skips are `Ok` reports; only fatal errors are `Err`.
pub fn process_image(ctx: &BatchContext, index: usize, path: &Path) -> Result<ImageReport> {
    let cfg = &ctx.cfg;
    let file_name = io::file_name(path);
    let requested = cfg.engine.variants_per_image;
    let report = |record: ImageRecord, resumed: bool| ImageReport { index, source: path.to_path_buf(), resumed, record };
    let skipped = |sha: Option<String>, skip: SkipReason| {
        warn!(image = %file_name, reason = %skip, "skipping image");
        report(ImageRecord::from_run(path, sha, &ImageRun::skipped(requested, skip)), false)
    };

    let sha = match io::sha256_file(path) {
        Ok(sha) => sha,
        Err(e) => return Ok(skipped(None, SkipReason::UnreadableImage { detail: e.to_string() })),
    };
    if let Some(prev) = ctx.resumed.get(&file_name) {
        if prev.source_sha256.as_deref() == Some(sha.as_str()) && prev.status.is_settled() {
            info!(image = %file_name, "already in journal, reusing record");
            return Ok(report(prev.clone(), true));
        }
    }
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > LARGE_INPUT_BYTES {
            warn!(image = %file_name, mb = meta.len() / (1024 * 1024), "large input file");
        }
    }

    let img = match post::load_normalized(path) {
        Ok(img) => img,
        Err(skip) => return Ok(skipped(Some(sha), skip)),
    };
    let img = match cfg.target_size()? {
        Some(max) => post::fit_within(img, max),
        None => img,
    };
    if img.width() < MIN_SOURCE_SIDE || img.height() < MIN_SOURCE_SIDE {
        let detail = format!("{}x{} is below the {MIN_SOURCE_SIDE}px minimum", img.width(), img.height());
        return Ok(skipped(Some(sha), SkipReason::UnreadableImage { detail }));
    }

    let mut rng = StdRng::seed_from_u64(image_seed(ctx.base_seed, &file_name));
    let delivery = Delivery::Jpeg(cfg.output.quality);
    let evaluator =
        CandidateEvaluator::new(&cfg.engine, ctx.hasher.as_ref(), ctx.transform.as_ref()).with_delivery(delivery);
    let engine = AcceptanceEngine::new(&cfg.engine, ctx.hasher.as_ref(), evaluator).with_delivery(delivery);
    let out_dir = io::variant_dir(&cfg.output.dir, path);
    let mut save = |v: &AcceptedVariant, rendition: &Rendition| -> Result<()> {
        if cfg.output.dry_run {
            return Ok(());
        }
        let target = out_dir.join(io::variant_file_name(path, v.ordinal));
        match &rendition.encoded {
            Some(bytes) => io::write_atomic(&target, bytes),
            None => io::save_variant(&target, &rendition.image, cfg.output.quality),
        }
    };
    let run = engine
        .run(&img, &mut rng, &ctx.cancel, &mut save)
        .map_err(|e| VariantError::at_image(path, e))?;

    match run.status {
        RunStatus::Completed => {
            info!(image = %file_name, variants = run.variants.len(), attempts = run.attempts, "image completed")
        }
        RunStatus::PartiallyCompleted => warn!(
            image = %file_name,
            produced = run.variants.len(),
            requested = run.requested,
            attempts = run.attempts,
            "image partially completed"
        ),
        RunStatus::Skipped { ref skip } => warn!(image = %file_name, reason = %skip, "skipping image"),
        RunStatus::Cancelled => info!(image = %file_name, produced = run.variants.len(), "image cancelled"),
    }
    Ok(report(ImageRecord::from_run(path, Some(sha), &run), false))
}

/// Per-image seed, independent of scheduling order.
pub fn image_seed(base: u64, file_name: &str) -> u64 {
    let digest = Sha256::digest(file_name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    base ^ u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{textured_image, DctHasher};
    use crate::transform::GeometricTransform;
    use tokio_stream::StreamExt;

    fn context(cfg: RunCfg) -> BatchContext {
        BatchContext {
            cfg: Arc::new(cfg),
            hasher: Arc::new(DctHasher::new()),
            transform: Arc::new(GeometricTransform),
            cancel: CancelFlag::new(),
            base_seed: 17,
            resumed: Arc::new(BTreeMap::new()),
        }
    }

    fn small_cfg(out: &Path) -> RunCfg {
        let mut cfg = RunCfg::default();
        cfg.engine.variants_per_image = 2;
        cfg.engine.max_attempts_per_variant = 5;
        cfg.engine.min_quality_threshold = 0;
        cfg.output.dir = out.to_path_buf();
        cfg.batch.concurrency = 2;
        cfg
    }

    #[tokio::test]
    async fn corrupt_image_is_isolated() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        textured_image(64, 64, 1).save(input.path().join("a.png")).unwrap();
        std::fs::write(input.path().join("b.jpg"), b"\xFF\xD8\xFF garbage").unwrap();
        textured_image(64, 64, 3).save(input.path().join("c.png")).unwrap();

        let images = io::list_supported_images(input.path()).unwrap();
        let reports: Vec<_> = run_batch(context(small_cfg(out.path())), images).collect().await;
        let mut reports: Vec<ImageReport> = reports.into_iter().map(|r| r.unwrap()).collect();
        reports.sort_by_key(|r| r.index);

        assert_eq!(reports.len(), 3);
        assert!(matches!(
            reports[1].record.status,
            RunStatus::Skipped { skip: SkipReason::UnreadableImage { .. } }
        ));
        for (r, stem) in [(&reports[0], "a"), (&reports[2], "c")] {
            assert!(matches!(r.record.status, RunStatus::Completed | RunStatus::PartiallyCompleted));
            assert!(r.record.total_attempts <= 10);
            r.record.verify(&small_cfg(out.path()).engine).unwrap();
            for v in &r.record.variants {
                assert!(out.path().join(stem).join(&v.filename).exists(), "{}", v.filename);
            }
        }
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        textured_image(64, 64, 2).save(input.path().join("a.png")).unwrap();
        let mut cfg = small_cfg(out.path());
        cfg.output.dry_run = true;

        let images = io::list_supported_images(input.path()).unwrap();
        let reports: Vec<_> = run_batch(context(cfg), images).collect().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_ok());
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancelled_batch_schedules_nothing() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        textured_image(64, 64, 2).save(input.path().join("a.png")).unwrap();
        let ctx = context(small_cfg(out.path()));
        ctx.cancel.cancel();

        let images = io::list_supported_images(input.path()).unwrap();
        let reports: Vec<_> = run_batch(ctx, images).collect().await;
        assert!(reports.is_empty());
    }

    #[test]
    fn low_quality_source_is_skipped() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let flat = image::RgbImage::from_pixel(64, 64, image::Rgb([90, 90, 90]));
        let path = input.path().join("flat.png");
        flat.save(&path).unwrap();
        let mut cfg = small_cfg(out.path());
        cfg.engine.min_quality_threshold = 50;

        let report = process_image(&context(cfg), 0, &path).unwrap();
        assert!(matches!(
            report.record.status,
            RunStatus::Skipped { skip: SkipReason::LowQuality { quality: 0, threshold: 50 } }
        ));
        assert_eq!(report.record.total_attempts, 0);
    }

    #[test]
    fn tiny_source_is_skipped() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let path = input.path().join("tiny.png");
        textured_image(8, 8, 0).save(&path).unwrap();
        let report = process_image(&context(small_cfg(out.path())), 0, &path).unwrap();
        assert!(report.record.is_skipped());
    }

    #[test]
    fn matching_journal_record_is_reused() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let path = input.path().join("a.png");
        textured_image(64, 64, 4).save(&path).unwrap();

        let mut ctx = context(small_cfg(out.path()));
        let first = process_image(&ctx, 0, &path).unwrap();
        assert!(!first.resumed);

        let mut resumed = BTreeMap::new();
        resumed.insert("a.png".to_string(), first.record.clone());
        ctx.resumed = Arc::new(resumed);
        let second = process_image(&ctx, 0, &path).unwrap();
        assert!(second.resumed);
        assert_eq!(second.record, first.record);
    }

    #[test]
    fn cancelled_journal_record_is_rerun() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let path = input.path().join("a.png");
        textured_image(64, 64, 4).save(&path).unwrap();

        let mut ctx = context(small_cfg(out.path()));
        ctx.cancel.cancel();
        let interrupted = process_image(&ctx, 0, &path).unwrap();
        assert_eq!(interrupted.record.status, RunStatus::Cancelled);
        assert_eq!(interrupted.record.produced, 0);

        let mut resumed = BTreeMap::new();
        resumed.insert("a.png".to_string(), interrupted.record);
        ctx.resumed = Arc::new(resumed);
        ctx.cancel = CancelFlag::new();
        let second = process_image(&ctx, 0, &path).unwrap();
        assert!(!second.resumed);
        assert!(matches!(second.record.status, RunStatus::Completed | RunStatus::PartiallyCompleted));
        assert!(second.record.total_attempts > 0);
    }

    #[test]
    fn saved_files_match_recorded_fingerprints() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let path = input.path().join("a.png");
        textured_image(96, 96, 6).save(&path).unwrap();
        let mut cfg = small_cfg(out.path());
        cfg.engine.variants_per_image = 4;
        cfg.engine.min_distance_from_original = 4;
        cfg.engine.min_distance_between_variants = 2;
        cfg.output.quality = 80;
        let ctx = context(cfg);

        let report = process_image(&ctx, 0, &path).unwrap();
        assert!(!report.record.variants.is_empty());
        let hasher = DctHasher::new();
        for v in &report.record.variants {
            let saved = post::load_normalized(&out.path().join("a").join(&v.filename)).unwrap();
            assert_eq!(hasher.hash(&saved).unwrap().fingerprint, v.fingerprint, "{}", v.filename);
        }

        let source = post::load_normalized(&path).unwrap();
        let (_, original) = Delivery::Jpeg(80).hash(&hasher, source).unwrap();
        assert_eq!(report.record.original_fingerprint, Some(original.fingerprint));
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let path = input.path().join("a.png");
        textured_image(64, 64, 5).save(&path).unwrap();
        let mut cfg = small_cfg(out.path());
        cfg.output.dry_run = true;
        let ctx = context(cfg);

        let a = process_image(&ctx, 0, &path).unwrap();
        let b = process_image(&ctx, 0, &path).unwrap();
        assert_eq!(a.record, b.record);
    }

    #[test]
    fn image_seed_depends_on_name_and_base() {
        assert_eq!(image_seed(1, "a.jpg"), image_seed(1, "a.jpg"));
        assert_ne!(image_seed(1, "a.jpg"), image_seed(1, "b.jpg"));
        assert_ne!(image_seed(1, "a.jpg"), image_seed(2, "a.jpg"));
    }
}
