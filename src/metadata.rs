use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::process::run_captured;
use crate::types::{Metadata, MetadataError, MetadataErrorKind, Playlist};
use crate::utils::bound_text;

const ERROR_LIMIT: usize = 300;

pub const SUPPORTED_BROWSERS: [&str; 7] = ["firefox", "chrome", "chromium", "brave", "edge", "opera", "safari"];

const AUTH_MARKERS: [&str; 5] = [
    "Sign in",
    "Age-restricted",
    "age-restricted",
    "confirm your age",
    "inappropriate for some users",
];

/// Classifies yt-dlp's diagnostic text; the text itself is kept, bounded.
pub fn classify_error(text: &str) -> MetadataError {
    let kind = if AUTH_MARKERS.iter().any(|m| text.contains(m)) {
        MetadataErrorKind::AuthRequired
    } else if text.contains("HTTP Error 429") {
        MetadataErrorKind::RateLimited
    } else if text.contains("Unsupported URL") {
        MetadataErrorKind::Unsupported
    } else if text.contains("Video unavailable") {
        MetadataErrorKind::Unavailable
    } else if text.contains("Requested format is not available") {
        MetadataErrorKind::NoFormats
    } else {
        MetadataErrorKind::Other
    };
    MetadataError {
        kind,
        message: bound_text(text, ERROR_LIMIT),
    }
}

fn cookie_args(args: &mut Vec<String>, cookie_browser: Option<&str>) {
    if let Some(browser) = cookie_browser {
        args.push("--cookies-from-browser".into());
        args.push(browser.to_string());
    }
}

/// Parses `playlist,playlist_title,playlist_count` as printed by yt-dlp.
pub fn parse_playlist_info(output: &str) -> Option<Playlist> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.splitn(3, ',');
    let id = parts.next()?;
    let rest = parts.next()?;
    let tail = parts.next()?;
    if id == "NA" {
        return None;
    }
    // titles may contain commas, the count is always last
    let joined = format!("{},{}", rest, tail);
    let (title, count) = joined.rsplit_once(',')?;
    let count: usize = count.trim().parse().ok()?;
    (count > 1).then(|| Playlist {
        title: title.to_string(),
        count,
    })
}

pub async fn fetch_metadata(ytdlp: &Path, url: &str, cookie_browser: Option<&str>) -> Result<Metadata, MetadataError> {
    let mut args = vec!["--get-title".to_string(), "--no-warnings".to_string()];
    cookie_args(&mut args, cookie_browser);
    args.push(url.to_string());

    let out = run_captured(ytdlp, &args).await.map_err(|e| MetadataError {
        kind: MetadataErrorKind::Other,
        message: format!("Failed to execute yt-dlp: {}", e),
    })?;
    if !out.success {
        let text = out.combined.trim();
        warn!(url, "metadata query failed");
        if text.is_empty() {
            return Err(MetadataError {
                kind: MetadataErrorKind::Other,
                message: "yt-dlp exited without output".into(),
            });
        }
        return Err(classify_error(text));
    }

    let title = out
        .stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| MetadataError {
            kind: MetadataErrorKind::Other,
            message: "no title found".into(),
        })?;

    let mut args = vec![
        "--flat-playlist".to_string(),
        "--print".to_string(),
        "playlist,playlist_title,playlist_count".to_string(),
        "--no-warnings".to_string(),
    ];
    cookie_args(&mut args, cookie_browser);
    args.push(url.to_string());
    let playlist = match run_captured(ytdlp, &args).await {
        Ok(out) => parse_playlist_info(&out.stdout),
        Err(e) => {
            debug!(error = %e, "playlist query failed, assuming single video");
            None
        }
    };

    info!(url, %title, playlist = playlist.is_some(), "metadata fetched");
    Ok(Metadata { title, playlist })
}

/// Asks yt-dlp which file name `output_template` resolves to for `url`.
pub async fn predict_filename(
    ytdlp: &Path,
    url: &str,
    cookie_browser: Option<&str>,
    output_template: &str,
) -> Result<String> {
    let mut args = vec![
        "--print".to_string(),
        "filename".to_string(),
        "--no-warnings".to_string(),
        "--output".to_string(),
        output_template.to_string(),
    ];
    cookie_args(&mut args, cookie_browser);
    args.push(url.to_string());
    let out = run_captured(ytdlp, &args).await?;
    if !out.success {
        return Err(anyhow!("{}", bound_text(&out.combined, ERROR_LIMIT)));
    }
    out.stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no filename found"))
}

/// The file in `output_dir` carrying the predicted name, if it is already there.
pub fn existing_download(output_dir: &Path, predicted: &str) -> Option<PathBuf> {
    let name = Path::new(predicted).file_name()?;
    let path = output_dir.join(name);
    path.is_file().then_some(path)
}

/// Which of the supported browsers are installed, in preference order.
pub async fn detect_browsers() -> Vec<String> {
    let locator = if cfg!(windows) { "where" } else { "which" };
    let mut found = Vec::new();
    for browser in SUPPORTED_BROWSERS {
        let status = Command::new(locator)
            .arg(browser)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if matches!(status, Ok(s) if s.success()) {
            found.push(browser.to_string());
        }
    }
    debug!(?found, "browser detection finished");
    found
}
