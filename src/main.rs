use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tokio_stream::StreamExt;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use varigen::batch::{run_batch, BatchContext};
use varigen::config::RunCfg;
use varigen::engine::{CancelFlag, RunStatus};
use varigen::hasher::{DctHasher, PerceptualHasher};
use varigen::inspect::{self, SIMILARITY_THRESHOLD};
use varigen::io::{self, SUPPORTED_EXTENSIONS};
use varigen::manifest::{resume_records, ImageRecord, Manifest, ManifestWriter};
use varigen::recipe::RecipeFamily;
use varigen::transform::GeometricTransform;

const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "varigen",
    version,
    about = "Generate perceptually distinct variants of images",
    after_help = "Exit codes:\n  0    success (partial images and skipped files included)\n  1    fatal error, or no supported images found\n  130  cancelled"
)]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate variants for every image in the input directory.
    Run(RunArgs),
    /// List the available recipe families.
    Recipes,
    /// Print the fingerprint and quality score of one image.
    Check {
        image: PathBuf,
        #[arg(long, default_value_t = 50)]
        min_quality: u8,
    },
    /// Print the Hamming distance between two images.
    Compare { image1: PathBuf, image2: PathBuf },
    /// Compare every image in a folder against every other one.
    Scan {
        folder: PathBuf,
        /// Pairs at or below this distance are reported as similar.
        #[arg(short, long, default_value_t = SIMILARITY_THRESHOLD)]
        threshold: u32,
        /// Show all pairs instead of only the similar ones.
        #[arg(short, long)]
        all: bool,
        /// Write the full report as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 50)]
        min_quality: u8,
    },
}

#[derive(Args)]
struct RunArgs {
    /// YAML config file; flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short = 'i', long)]
    input_dir: Option<PathBuf>,
    #[arg(short = 'o', long)]
    output_dir: Option<PathBuf>,
    /// Variants to generate per image.
    #[arg(short = 'n', long)]
    variants: Option<u32>,
    /// Minimum Hamming distance from the original.
    #[arg(long)]
    min_distance: Option<u32>,
    /// Minimum Hamming distance between variants of one image.
    #[arg(long)]
    min_variant_distance: Option<u32>,
    /// Attempts per variant slot before it is abandoned.
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Stop an image after this many abandoned slots.
    #[arg(long)]
    max_failed_slots: Option<u32>,
    /// Minimum fingerprint quality for sources and candidates.
    #[arg(long)]
    min_quality: Option<u8>,
    /// JPEG output quality (1-100).
    #[arg(short = 'q', long)]
    quality: Option<u8>,
    /// Fit sources inside WIDTHxHEIGHT before generating variants.
    #[arg(long)]
    target_size: Option<String>,
    /// Comma-separated recipe families to use.
    #[arg(long, value_delimiter = ',')]
    recipes: Option<Vec<RecipeFamily>>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Compute everything but write no files.
    #[arg(long)]
    dry_run: bool,
    /// Reuse results for images already in the output journal.
    #[arg(long)]
    resume: bool,
}

impl RunArgs {
    fn resolve(&self) -> Result<RunCfg> {
        let mut cfg = match &self.config {
            Some(path) => RunCfg::from_yaml_file(path)?,
            None => RunCfg::default(),
        };
        if let Some(v) = &self.input_dir { cfg.input_dir = v.clone(); }
        if let Some(v) = &self.output_dir { cfg.output.dir = v.clone(); }
        if let Some(v) = self.variants { cfg.engine.variants_per_image = v; }
        if let Some(v) = self.min_distance { cfg.engine.min_distance_from_original = v; }
        if let Some(v) = self.min_variant_distance { cfg.engine.min_distance_between_variants = v; }
        if let Some(v) = self.max_attempts { cfg.engine.max_attempts_per_variant = v; }
        if let Some(v) = self.max_failed_slots { cfg.engine.max_failed_slots = Some(v); }
        if let Some(v) = self.min_quality { cfg.engine.min_quality_threshold = v; }
        if let Some(v) = self.quality { cfg.output.quality = v; }
        if let Some(v) = &self.target_size { cfg.output.target_size = Some(v.clone()); }
        if let Some(v) = &self.recipes { cfg.engine.recipes_enabled = v.clone(); }
        if let Some(v) = self.concurrency { cfg.batch.concurrency = v; }
        if let Some(v) = self.seed { cfg.seed = Some(v); }
        cfg.output.dry_run |= self.dry_run;
        cfg.batch.resume |= self.resume;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("warn,varigen={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

async fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run(args) => run(args).await,
        Command::Recipes => {
            println!("Available recipes:");
            for family in RecipeFamily::ALL {
                println!("  {:<18} {}", family.name(), family.describe());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { image, min_quality } => check(&image, min_quality),
        Command::Compare { image1, image2 } => compare(&image1, &image2),
        Command::Scan { folder, threshold, all, output, min_quality } => {
            scan(&folder, threshold, all, output.as_deref(), min_quality)
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let cfg = args.resolve()?;
    let hasher: Arc<dyn PerceptualHasher> = Arc::new(DctHasher::new());
    cfg.validate(hasher.bits())?;

    let images = io::list_supported_images(&cfg.input_dir)
        .with_context(|| format!("cannot read input directory {}", cfg.input_dir.display()))?;
    if images.is_empty() {
        bail!(
            "no supported images found in {} (supported: {})",
            cfg.input_dir.display(),
            SUPPORTED_EXTENSIONS.join(", ")
        );
    }

    let seed = cfg.seed.unwrap_or_else(|| rand::rng().random());
    let out_dir = cfg.output.dir.clone();
    let dry_run = cfg.output.dry_run;

    println!("Input directory:  {}", cfg.input_dir.display());
    println!("Output directory: {}", out_dir.display());
    println!("Images found:     {}", images.len());
    println!("Variants/image:   {}", cfg.engine.variants_per_image);
    println!(
        "Min distance:     {} from original, {} between variants",
        cfg.engine.min_distance_from_original, cfg.engine.min_distance_between_variants
    );
    println!("Seed:             {seed}");
    if dry_run {
        println!("DRY RUN - no files will be written");
    }
    println!();

    let journal_path = out_dir.join("manifest.jsonl");
    let resumed = if cfg.batch.resume { resume_records(&journal_path).await? } else { BTreeMap::new() };
    let journal = if dry_run {
        None
    } else {
        if !cfg.batch.resume {
            match tokio::fs::remove_file(&journal_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("cannot reset {}", journal_path.display())),
            }
        }
        Some(ManifestWriter::open(journal_path).await?)
    };

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after current attempts");
                cancel.cancel();
            }
        });
    }

    let cfg = Arc::new(cfg);
    let ctx = BatchContext {
        cfg: cfg.clone(),
        hasher: hasher.clone(),
        transform: Arc::new(GeometricTransform),
        cancel: cancel.clone(),
        base_seed: seed,
        resumed: Arc::new(resumed),
    };

    let pb = ProgressBar::new(images.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40.cyan/blue}] {pos}/{len} images {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let mut stream = run_batch(ctx, images);
    let mut records: Vec<ImageRecord> = Vec::new();
    let mut fatal = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(report) => {
                if let (Some(journal), false) = (&journal, report.resumed) {
                    if let Err(e) = journal.append(&report.record).await {
                        cancel.cancel();
                        fatal.get_or_insert(e);
                    }
                }
                pb.set_message(report.record.file_name.clone());
                pb.inc(1);
                records.push(report.record);
            }
            Err(e) => {
                fatal.get_or_insert(e);
            }
        }
    }
    pb.finish_and_clear();
    if let Some(e) = fatal {
        return Err(anyhow::Error::new(e).context("batch aborted"));
    }

    let manifest = Manifest::new(Uuid::new_v4(), hasher.name(), seed, &cfg, records);
    if dry_run {
        manifest.verify()?;
    } else {
        manifest.write(&out_dir.join("manifest.json"))?;
    }
    print_results(&manifest);

    if cancel.is_cancelled() {
        println!("Cancelled before all images were processed.");
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    if dry_run {
        println!("DRY RUN complete - no files written");
    } else {
        println!("Output:   {}", out_dir.display());
        println!("Manifest: {}", out_dir.join("manifest.json").display());
    }
    if let Some(journal) = &journal {
        println!("Journal:  {}", journal.path().display());
    }
    Ok(ExitCode::SUCCESS)
}

fn print_results(manifest: &Manifest) {
    println!("{:<32} {:>8} {:>8} {:>9}  Status", "Image", "Variants", "AvgDist", "Attempts");
    for (name, rec) in &manifest.images {
        let status = match &rec.status {
            RunStatus::Completed => "OK".to_string(),
            RunStatus::PartiallyCompleted if rec.produced > 0 => format!("{}/{}", rec.produced, rec.requested),
            RunStatus::PartiallyCompleted => "Failed".to_string(),
            RunStatus::Skipped { skip } => format!("Skipped: {skip}"),
            RunStatus::Cancelled => format!("Cancelled ({}/{})", rec.produced, rec.requested),
        };
        if rec.is_skipped() {
            println!("{:<32} {:>8} {:>8} {:>9}  {status}", truncate(name, 32), "-", "-", "-");
            continue;
        }
        let avg = rec.variants.iter().map(|v| v.distance_from_original as f64).sum::<f64>() / rec.produced.max(1) as f64;
        println!("{:<32} {:>8} {:>8.0} {:>9}  {status}", truncate(name, 32), rec.produced, avg, rec.total_attempts);
    }
    let s = &manifest.summary;
    println!();
    println!("Total:            {} variants from {} images", s.total_variants, s.total_images);
    println!(
        "Outcomes:         {} completed, {} partial, {} skipped, {} cancelled",
        s.completed, s.partially_completed, s.skipped, s.cancelled
    );
    println!("Average distance: {}", s.avg_distance);
    println!("Success rate:     {:.1}%", s.success_rate);
    println!(
        "Rejections:       {} ({} low quality, {} near original, {} near another variant)",
        s.rejections.total(),
        s.rejections.low_quality, s.rejections.too_similar_to_original, s.rejections.too_similar_to_variant
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}

fn check(image: &Path, min_quality: u8) -> Result<ExitCode> {
    let hasher = DctHasher::new();
    let out = inspect::hash_file(&hasher, image)?;
    println!("Checking: {}", image.display());
    println!("Hash:     {}", out.fingerprint);
    println!("Quality:  {}", out.quality);
    if out.quality < min_quality {
        println!("Warning: quality below threshold ({min_quality})");
    } else {
        println!("Quality OK");
    }
    Ok(ExitCode::SUCCESS)
}

fn compare(image1: &Path, image2: &Path) -> Result<ExitCode> {
    let hasher = DctHasher::new();
    let a = inspect::hash_file(&hasher, image1)?;
    let b = inspect::hash_file(&hasher, image2)?;
    let distance = a.fingerprint.distance(&b.fingerprint)?;
    for (label, path, out) in [("Image 1", image1, &a), ("Image 2", image2, &b)] {
        println!("{label}: {}", io::file_name(path));
        println!("  Hash:    {}", out.fingerprint);
        println!("  Quality: {}", out.quality);
    }
    println!("Hamming distance: {distance}");
    if distance <= SIMILARITY_THRESHOLD {
        println!("SIMILAR (distance <= {SIMILARITY_THRESHOLD})");
    } else {
        println!("DIFFERENT (distance > {SIMILARITY_THRESHOLD})");
    }
    Ok(ExitCode::SUCCESS)
}

fn scan(folder: &Path, threshold: u32, all: bool, output: Option<&Path>, min_quality: u8) -> Result<ExitCode> {
    let hasher = DctHasher::new();
    let report = inspect::scan(&hasher, folder, threshold, min_quality)?;
    if report.images.len() + report.skipped.len() < 2 {
        bail!("need at least 2 images to compare, found {}", report.images.len() + report.skipped.len());
    }

    for (name, reason) in report.skipped.iter().take(5) {
        println!("Skipped {name}: {reason}");
    }
    if report.skipped.len() > 5 {
        println!("... and {} more skipped", report.skipped.len() - 5);
    }

    let shown: Vec<_> = if all { report.comparisons.iter().collect() } else { report.similar_pairs().collect() };
    if shown.is_empty() {
        println!("No similar pairs found (all distances > {threshold})");
    } else {
        println!("{:<30} {:<30} {:>8}  Status", "Image 1", "Image 2", "Distance");
        for pair in shown.iter().take(50) {
            let status = if pair.distance <= threshold {
                "SIMILAR"
            } else if pair.distance <= 50 {
                "CLOSE"
            } else {
                "DIFFERENT"
            };
            println!("{:<30} {:<30} {:>8}  {status}", truncate(&pair.image1, 30), truncate(&pair.image2, 30), pair.distance);
        }
        if shown.len() > 50 {
            println!("... +{} more", shown.len() - 50);
        }
    }

    let distances: Vec<u32> = report.comparisons.iter().map(|p| p.distance).collect();
    println!();
    println!("Images scanned: {}", report.images.len());
    println!("Total pairs:    {}", distances.len());
    println!("Similar pairs:  {} (distance <= {threshold})", report.similar_pairs().count());
    if let (Some(min), Some(max)) = (distances.iter().min(), distances.iter().max()) {
        let avg = distances.iter().map(|&d| d as f64).sum::<f64>() / distances.len() as f64;
        println!("Min distance:   {min}");
        println!("Max distance:   {max}");
        println!("Avg distance:   {avg:.1}");
    }

    if let Some(path) = output {
        let bytes = serde_json::to_vec_pretty(&report)?;
        io::write_atomic(path, &bytes)?;
        println!("Results saved to: {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}
