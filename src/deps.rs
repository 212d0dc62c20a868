use anyhow::{Context, Result};
use console::{style, Term};
use dialoguer::Confirm;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use crate::types::AppError;

const YTDLP_RELEASE: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";

pub struct ResolveResult {
    pub path: PathBuf,
    pub config_needs_update: bool,
}

fn binary_name(tool: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", tool)
    } else {
        tool.to_string()
    }
}

/// Where a downloaded copy of `tool` lives.
pub fn bundled_path(config_dir: &Path, tool: &str) -> PathBuf {
    config_dir.join("bin").join(binary_name(tool))
}

async fn runs(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Configured path, then PATH, then the config directory.
async fn locate(configured: &str, tool: &str, config_dir: &Path) -> Option<ResolveResult> {
    if configured.is_empty() || configured == tool {
        if runs(Path::new(tool)).await {
            return Some(ResolveResult {
                path: PathBuf::from(tool),
                config_needs_update: false,
            });
        }
    } else {
        let path = PathBuf::from(configured);
        if path.is_file() {
            return Some(ResolveResult {
                path,
                config_needs_update: false,
            });
        }
    }

    let bundled = bundled_path(config_dir, tool);
    if bundled.is_file() {
        return Some(ResolveResult {
            config_needs_update: configured != bundled.to_string_lossy(),
            path: bundled,
        });
    }
    None
}

pub async fn resolve_ytdlp(configured: &str, config_dir: &Path, term: &Term) -> Result<ResolveResult> {
    if let Some(found) = locate(configured, "yt-dlp", config_dir).await {
        info!(path = %found.path.display(), "yt-dlp resolved");
        return Ok(found);
    }

    if Confirm::new()
        .with_prompt("yt-dlp not found. Download it to the config directory?")
        .default(true)
        .interact_on(term)?
    {
        match download_ytdlp(config_dir, term).await {
            Ok(path) => {
                return Ok(ResolveResult {
                    path,
                    config_needs_update: true,
                })
            }
            Err(e) => {
                warn!(error = %e, "yt-dlp download failed");
                term.write_line(&format!("{}", style(format!("Download failed: {:#}", e)).red()))?;
            }
        }
    }

    Err(AppError::MissingTool("yt-dlp".into()).into())
}

/// aria2c is optional: `None` disables accelerated transfers.
pub async fn resolve_aria2c(configured: &str, config_dir: &Path) -> Option<PathBuf> {
    match locate(configured, "aria2c", config_dir).await {
        Some(found) => Some(found.path),
        None => {
            warn!("aria2c not found, accelerated transfers disabled");
            None
        }
    }
}

async fn download_ytdlp(config_dir: &Path, term: &Term) -> Result<PathBuf> {
    let target = bundled_path(config_dir, "yt-dlp");
    let bin_dir = target.parent().context("bundled path has no parent")?;
    fs::create_dir_all(bin_dir)?;

    term.write_line("Downloading yt-dlp...")?;
    let url = format!("{}/{}", YTDLP_RELEASE, binary_name("yt-dlp"));
    let resp = reqwest::Client::new().get(&url).send().await?.error_for_status()?;
    let total = resp.content_length().unwrap_or(0);
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) ({eta})")?
            .progress_chars("█▓▒░-"),
    );

    let tmp = target.with_extension("tmp");
    let mut file = File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
    let mut stream = resp.bytes_stream();
    let mut downloaded: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)?;
        downloaded += chunk.len() as u64;
        pb.set_position(downloaded);
    }
    drop(file);
    fs::rename(&tmp, &target)?;
    pb.finish_with_message("Download complete");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
    }

    info!(path = %target.display(), "yt-dlp downloaded");
    term.write_line("yt-dlp ready.")?;
    Ok(target)
}
