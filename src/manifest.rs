use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::{self, OpenOptions}, io::{AsyncBufReadExt, AsyncWriteExt}, sync::Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::config::{EngineCfg, RunCfg};
use crate::engine::{audit, ImageRun, RejectionCounts, RunStatus};
use crate::error::{Result, VariantError};
use crate::fingerprint::Fingerprint;
use crate::recipe::RecipeSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub ordinal: u32,
    pub filename: String,
    pub recipe: RecipeSpec,
    pub distance_from_original: u32,
    pub min_distance_to_prior: Option<u32>,
    pub fingerprint: Fingerprint,
    pub quality: u8,
    pub attempts: u32,
}

/// Everything recorded about one source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub file_name: String,
    pub source_sha256: Option<String>,
    #[serde(flatten)]
    pub status: RunStatus,
    pub original_fingerprint: Option<Fingerprint>,
    pub original_quality: Option<u8>,
    pub requested: u32,
    pub produced: u32,
    pub unmet_slots: u32,
    pub total_attempts: u32,
    pub rejections: RejectionCounts,
    pub variants: Vec<VariantRecord>,
}

impl ImageRecord {
    pub fn from_run(source: &Path, source_sha256: Option<String>, run: &ImageRun) -> Self {
        let variants = run
            .variants
            .iter()
            .map(|v| VariantRecord {
                ordinal: v.ordinal,
                filename: crate::io::variant_file_name(source, v.ordinal),
                recipe: v.recipe.clone(),
                distance_from_original: v.distance_from_original,
                min_distance_to_prior: v.min_distance_to_prior,
                fingerprint: v.fingerprint.clone(),
                quality: v.quality,
                attempts: v.attempts,
            })
            .collect::<Vec<_>>();
        Self {
            file_name: crate::io::file_name(source),
            source_sha256,
            status: run.status.clone(),
            original_fingerprint: run.original.as_ref().map(|o| o.fingerprint.clone()),
            original_quality: run.original.as_ref().map(|o| o.quality),
            requested: run.requested,
            produced: variants.len() as u32,
            unmet_slots: run.unmet_slots,
            total_attempts: run.attempts,
            rejections: run.rejections,
            variants,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, RunStatus::Skipped { .. })
    }

    /// Re-checks the accepted set against both distance thresholds.
    pub fn verify(&self, cfg: &EngineCfg) -> Result<()> {
        let Some(original) = &self.original_fingerprint else {
            if self.variants.is_empty() {
                return Ok(());
            }
            return Err(VariantError::InvariantViolation {
                image: self.file_name.clone(),
                detail: "variants recorded without an original fingerprint".into(),
            });
        };
        audit(&self.file_name, cfg, original, self.variants.iter().map(|v| &v.fingerprint))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_images: u32,
    pub completed: u32,
    pub partially_completed: u32,
    pub skipped: u32,
    pub cancelled: u32,
    pub total_variants: u32,
    pub requested_variants: u32,
    pub avg_distance: f64,
    /// Produced / requested over images that were not skipped, in percent.
    pub success_rate: f64,
    pub total_attempts: u64,
    pub rejections: RejectionCounts,
}

impl Summary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ImageRecord>) -> Self {
        let mut s = Summary::default();
        let mut distance_sum: u64 = 0;
        for r in records {
            s.total_images += 1;
            match r.status {
                RunStatus::Completed => s.completed += 1,
                RunStatus::PartiallyCompleted => s.partially_completed += 1,
                RunStatus::Skipped { .. } => s.skipped += 1,
                RunStatus::Cancelled => s.cancelled += 1,
            }
            if !r.is_skipped() {
                s.requested_variants += r.requested;
            }
            s.total_variants += r.produced;
            s.total_attempts += r.total_attempts as u64;
            s.rejections.add(&r.rejections);
            distance_sum += r.variants.iter().map(|v| v.distance_from_original as u64).sum::<u64>();
        }
        if s.total_variants > 0 {
            s.avg_distance = round1(distance_sum as f64 / s.total_variants as f64);
        }
        if s.requested_variants > 0 {
            s.success_rate = round1(s.total_variants as f64 * 100.0 / s.requested_variants as f64);
        }
        s
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Aggregate written once the batch finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub hasher: String,
    pub seed: u64,
    pub dry_run: bool,
    pub engine: EngineCfg,
    pub output_quality: u8,
    pub target_size: Option<String>,
    pub images: BTreeMap<String, ImageRecord>,
    pub summary: Summary,
}

impl Manifest {
    pub fn new(run_id: Uuid, hasher: &str, seed: u64, cfg: &RunCfg, records: Vec<ImageRecord>) -> Self {
        let summary = Summary::from_records(&records);
        Self {
            run_id,
            generated_at: Utc::now(),
            hasher: hasher.to_string(),
            seed,
            dry_run: cfg.output.dry_run,
            engine: cfg.engine.clone(),
            output_quality: cfg.output.quality,
            target_size: cfg.output.target_size.clone(),
            images: records.into_iter().map(|r| (r.file_name.clone(), r)).collect(),
            summary,
        }
    }

    /// Fails on the first record whose accepted set breaks a distance invariant.
    pub fn verify(&self) -> Result<()> {
        self.images.values().try_for_each(|r| r.verify(&self.engine))
    }

    /// Verifies, then writes pretty JSON atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        self.verify()?;
        let bytes = serde_json::to_vec_pretty(self)?;
        crate::io::write_atomic(path, &bytes)
    }
}

/// Append-only JSONL journal, one line per finished image.
#[derive(Clone)]
pub struct ManifestWriter {
    file: Arc<Mutex<tokio::fs::File>>,
    path: PathBuf,
}

impl ManifestWriter {
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| VariantError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| VariantError::io(&path, e))?;
        Ok(Self { file: Arc::new(Mutex::new(file)), path })
    }

    pub async fn append(&self, rec: &ImageRecord) -> Result<()> {
        let mut line = serde_json::to_vec(rec)?;
        line.push(b'\n');
        let mut f = self.file.lock().await;
        f.write_all(&line).await.map_err(|e| VariantError::io(&self.path, e))?;
        f.flush().await.map_err(|e| VariantError::io(&self.path, e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Records from an earlier journal, last entry per file winning. A missing
/// journal yields nothing; unparsable lines are skipped with a warning.
pub async fn resume_records(path: &Path) -> Result<BTreeMap<String, ImageRecord>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(VariantError::io(path, e)),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut records = BTreeMap::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.map_err(|e| VariantError::io(path, e))? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ImageRecord>(&line) {
            Ok(rec) => {
                records.insert(rec.file_name.clone(), rec);
            }
            Err(e) => warn!(journal = %path.display(), line = line_no, error = %e, "skipping unreadable journal line"),
        }
    }
    Ok(records)
}
