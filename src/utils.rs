use anyhow::{anyhow, Context, Result};
use sanitize_filename::sanitize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Cuts `text` to at most `max` characters, appending "..." when anything was dropped.
pub fn bound_text(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Directory name for a title. Whitespace runs become `_`; an empty result falls
/// back to `<prefix>_<unix time>`.
pub fn dir_name_for(title: &str, prefix: &str) -> String {
    let cleaned = sanitize(title);
    let cleaned = cleaned.trim_matches(|c: char| c.is_whitespace() || c == '.');
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join("_");
    if joined.is_empty() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!("{}_{}", prefix, stamp)
    } else {
        joined
    }
}

/// Creates `base`, or `base_1`, `base_2`, ... when it already exists.
pub fn create_unique_dir(base: &Path) -> Result<PathBuf> {
    let mut candidate = base.to_path_buf();
    let mut counter = 1;
    while candidate.exists() {
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        candidate = base.with_file_name(format!("{}_{}", name, counter));
        counter += 1;
    }
    fs::create_dir_all(&candidate)
        .with_context(|| format!("Failed to create directory {}", candidate.display()))?;
    Ok(candidate)
}

/// First regular file with an extension below `dir`, depth first.
pub fn find_output_file(dir: &Path) -> Result<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for path in &entries {
        if path.is_file() && path.extension().is_some() {
            return Ok(path.clone());
        }
    }
    for path in &entries {
        if path.is_dir() {
            if let Ok(found) = find_output_file(path) {
                return Ok(found);
            }
        }
    }
    Err(anyhow!("no file found in {}", dir.display()))
}

/// Moves `src` into `dest_dir`, refusing to overwrite. Returns the new path.
pub fn move_into(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", src.display()))?;
    let dest = dest_dir.join(name);
    if dest.exists() {
        return Err(anyhow!("destination file already exists: {}", dest.display()));
    }
    if fs::rename(src, &dest).is_err() {
        // rename fails across filesystems
        fs::copy(src, &dest)?;
        fs::remove_file(src)?;
    }
    Ok(dest)
}

/// Where a finished download ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    /// The single output file now lives in the output directory.
    Moved(PathBuf),
    /// The working directory stays, e.g. for playlists or when moving would overwrite.
    Kept(PathBuf),
    Removed,
}

/// Resolves a working directory after the session ended. Successful single
/// downloads are moved up into `output_dir`; failures leave nothing behind.
pub fn settle_work_dir(work_dir: &Path, output_dir: &Path, success: bool, keep_dir: bool) -> Result<Settled> {
    if !success {
        if work_dir.exists() {
            fs::remove_dir_all(work_dir)
                .with_context(|| format!("Failed to remove {}", work_dir.display()))?;
        }
        return Ok(Settled::Removed);
    }
    if keep_dir {
        return Ok(Settled::Kept(work_dir.to_path_buf()));
    }
    let file = match find_output_file(work_dir) {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, "no output file to move, removing working directory");
            fs::remove_dir_all(work_dir)
                .with_context(|| format!("Failed to remove {}", work_dir.display()))?;
            return Ok(Settled::Removed);
        }
    };
    match move_into(&file, output_dir) {
        Ok(dest) => {
            fs::remove_dir_all(work_dir)
                .with_context(|| format!("Failed to remove {}", work_dir.display()))?;
            Ok(Settled::Moved(dest))
        }
        Err(e) => {
            warn!(error = %e, "leaving download in its working directory");
            Ok(Settled::Kept(work_dir.to_path_buf()))
        }
    }
}
