use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::error::{Result, VariantError};

/// Extensions picked up from the input directory (case-insensitive).
pub const SUPPORTED_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "webp", "heic", "heif"];

/// Files with a supported extension directly inside `dir`, sorted by lowercase name.
pub fn list_supported_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| VariantError::io(dir, e))?;
    let mut images = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| VariantError::io(dir, e))?.path();
        if path.is_file() && is_supported(&path) {
            images.push(path);
        }
    }
    images.sort_by_key(|p| file_name(p).to_lowercase());
    Ok(images)
}

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "image".into())
}

/// Per-source output folder, `<out>/<slugified stem>`.
pub fn variant_dir(out_dir: &Path, source: &Path) -> PathBuf {
    let slug = slug::slugify(file_stem(source));
    out_dir.join(if slug.is_empty() { "image".to_string() } else { slug })
}

pub fn variant_file_name(source: &Path, ordinal: u32) -> String {
    format!("{}_v{:02}.jpg", file_stem(source), ordinal)
}

/// Writes `bytes` to `path` via a temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| VariantError::io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp).map_err(|e| VariantError::io(&tmp, e))?;
        f.write_all(bytes).map_err(|e| VariantError::io(&tmp, e))?;
        let _ = f.sync_all(); // best-effort
    }
    fs::rename(&tmp, path).map_err(|e| VariantError::io(path, e))
}

/// Encodes a variant as JPEG and writes it atomically.
pub fn save_variant(path: &Path, img: &RgbImage, quality: u8) -> Result<()> {
    let bytes = crate::post::encode_jpeg(img, quality)
        .map_err(|source| VariantError::Encode { path: path.to_path_buf(), source })?;
    write_atomic(path, &bytes)
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| VariantError::io(path, e))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
