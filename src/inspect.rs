use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, VariantError};
use crate::fingerprint::Fingerprint;
use crate::hasher::{HashOutput, PerceptualHasher};
use crate::io;

/// Distances at or below this are what hash-matching systems treat as the same image.
pub const SIMILARITY_THRESHOLD: u32 = 31;

/// Loads and hashes one image. Unreadable files are errors here.
pub fn hash_file(hasher: &dyn PerceptualHasher, path: &Path) -> Result<HashOutput> {
    let img = crate::post::load_normalized(path)
        .map_err(|skip| VariantError::at_image(path, VariantError::Hash(skip.to_string())))?;
    hasher.hash(&img).map_err(|e| VariantError::at_image(path, e))
}

#[derive(Debug, Clone, Serialize)]
pub struct HashedImage {
    pub path: PathBuf,
    pub hash: Fingerprint,
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairDistance {
    pub image1: String,
    pub image2: String,
    pub distance: u32,
    pub similar: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub folder: PathBuf,
    pub threshold: u32,
    pub images: BTreeMap<String, HashedImage>,
    pub skipped: Vec<(String, String)>,
    /// Sorted by ascending distance.
    pub comparisons: Vec<PairDistance>,
}

impl ScanReport {
    pub fn similar_pairs(&self) -> impl Iterator<Item = &PairDistance> {
        self.comparisons.iter().filter(|p| p.similar)
    }
}

/// Hashes every supported image in `folder` and compares all pairs.
/// Images below `min_quality` or that fail to load are listed as skipped.
pub fn scan(hasher: &dyn PerceptualHasher, folder: &Path, threshold: u32, min_quality: u8) -> Result<ScanReport> {
    let mut images = BTreeMap::new();
    let mut skipped = Vec::new();
    for path in io::list_supported_images(folder)? {
        let name = io::file_name(&path);
        match hash_file(hasher, &path) {
            Ok(out) if out.quality >= min_quality => {
                images.insert(name, HashedImage { path, hash: out.fingerprint, quality: out.quality });
            }
            Ok(out) => skipped.push((name, format!("low quality ({})", out.quality))),
            Err(e) => skipped.push((name, e.to_string())),
        }
    }

    let entries: Vec<(&String, &HashedImage)> = images.iter().collect();
    let mut comparisons = Vec::new();
    for (i, (name_a, a)) in entries.iter().enumerate() {
        for (name_b, b) in &entries[i + 1..] {
            let distance = a.hash.distance(&b.hash)?;
            comparisons.push(PairDistance {
                image1: name_a.to_string(),
                image2: name_b.to_string(),
                distance,
                similar: distance <= threshold,
            });
        }
    }
    comparisons.sort_by_key(|p| p.distance);

    Ok(ScanReport { folder: folder.to_path_buf(), threshold, images, skipped, comparisons })
}
