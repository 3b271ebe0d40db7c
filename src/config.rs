use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VariantError};
use crate::recipe::RecipeFamily;

/// Acceptance thresholds and attempt budgets, shared read-only by every image run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineCfg {
    pub variants_per_image: u32,
    pub min_distance_from_original: u32,
    pub min_distance_between_variants: u32,
    /// Rejected attempts tolerated per variant slot before the slot is abandoned.
    pub max_attempts_per_variant: u32,
    /// Stop an image early after this many abandoned slots.
    pub max_failed_slots: Option<u32>,
    pub min_quality_threshold: u8,
    pub recipes_enabled: Vec<RecipeFamily>,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            variants_per_image: 10,
            min_distance_from_original: 32,
            min_distance_between_variants: 20,
            max_attempts_per_variant: 100,
            max_failed_slots: None,
            min_quality_threshold: 50,
            recipes_enabled: RecipeFamily::ALL.to_vec(),
        }
    }
}

impl EngineCfg {
    /// Upper bound on candidates evaluated for one image.
    pub fn max_total_attempts(&self) -> u64 {
        self.variants_per_image as u64 * self.max_attempts_per_variant as u64
    }

    pub fn validate(&self, hash_bits: u32) -> Result<()> {
        if self.variants_per_image == 0 {
            return Err(invalid("engine.variants_per_image must be at least 1"));
        }
        if self.max_attempts_per_variant == 0 {
            return Err(invalid("engine.max_attempts_per_variant must be at least 1"));
        }
        if self.max_total_attempts() > u32::MAX as u64 {
            return Err(VariantError::Config(format!(
                "engine.variants_per_image x engine.max_attempts_per_variant ({}) exceeds {}",
                self.max_total_attempts(),
                u32::MAX
            )));
        }
        if self.max_failed_slots == Some(0) {
            return Err(invalid("engine.max_failed_slots must be at least 1 when set"));
        }
        if self.min_quality_threshold > 100 {
            return Err(invalid("engine.min_quality_threshold must be within 0..=100"));
        }
        if self.min_distance_from_original > hash_bits {
            return Err(VariantError::Config(format!(
                "engine.min_distance_from_original ({}) exceeds the {hash_bits}-bit fingerprint",
                self.min_distance_from_original
            )));
        }
        if self.min_distance_between_variants > hash_bits {
            return Err(VariantError::Config(format!(
                "engine.min_distance_between_variants ({}) exceeds the {hash_bits}-bit fingerprint",
                self.min_distance_between_variants
            )));
        }
        if self.recipes_enabled.is_empty() {
            return Err(invalid("engine.recipes_enabled must name at least one recipe"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputCfg {
    pub dir: PathBuf,
    /// JPEG quality, 1..=100.
    pub quality: u8,
    /// `WIDTHxHEIGHT`; sources are shrunk to fit inside it.
    pub target_size: Option<String>,
    pub dry_run: bool,
}

impl Default for OutputCfg {
    fn default() -> Self {
        Self { dir: PathBuf::from("output"), quality: 95, target_size: None, dry_run: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchCfg {
    pub concurrency: usize,
    pub resume: bool,
}

impl Default for BatchCfg {
    fn default() -> Self {
        let concurrency = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self { concurrency, resume: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCfg {
    pub input_dir: PathBuf,
    pub engine: EngineCfg,
    pub output: OutputCfg,
    pub batch: BatchCfg,
    pub seed: Option<u64>,
}

impl Default for RunCfg {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            engine: EngineCfg::default(),
            output: OutputCfg::default(),
            batch: BatchCfg::default(),
            seed: None,
        }
    }
}

impl RunCfg {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path).map_err(|e| VariantError::io(path, e))?;
        serde_yaml::from_str(&txt)
            .map_err(|e| VariantError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn validate(&self, hash_bits: u32) -> Result<()> {
        self.engine.validate(hash_bits)?;
        if !(1..=100).contains(&self.output.quality) {
            return Err(invalid("output.quality must be within 1..=100"));
        }
        if let Some(size) = &self.output.target_size {
            parse_target_size(size)?;
        }
        if self.batch.concurrency == 0 {
            return Err(invalid("batch.concurrency must be at least 1"));
        }
        Ok(())
    }

    pub fn target_size(&self) -> Result<Option<(u32, u32)>> {
        self.output.target_size.as_deref().map(parse_target_size).transpose()
    }
}

/// Parses `WIDTHxHEIGHT`, e.g. `1080x1350`.
pub fn parse_target_size(s: &str) -> Result<(u32, u32)> {
    let bad = || VariantError::Config(format!("invalid target size '{s}', expected WIDTHxHEIGHT (e.g. 1080x1350)"));
    let lower = s.trim().to_ascii_lowercase();
    let (w, h) = lower.split_once('x').ok_or_else(bad)?;
    let w: u32 = w.trim().parse().map_err(|_| bad())?;
    let h: u32 = h.trim().parse().map_err(|_| bad())?;
    if w == 0 || h == 0 {
        return Err(bad());
    }
    Ok((w, h))
}

fn invalid(msg: &str) -> VariantError {
    VariantError::Config(msg.to_string())
}
