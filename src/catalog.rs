//! Reduces yt-dlp's `--list-formats` table to one ranked format per height.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::process::run_captured;
use crate::types::{AppError, Catalog, Format};
use crate::utils::bound_text;

/// The container yt-dlp merges into by default.
pub const DEFAULT_CONTAINER: &str = "mp4";

const KNOWN_CONTAINERS: [&str; 9] = ["mp4", "webm", "m4a", "mp3", "3gp", "mkv", "flv", "ogg", "opus"];
const ERROR_LIMIT: usize = 200;

fn parse_height(field: &str) -> Option<u32> {
    let (w, h) = field.split_once('x')?;
    if w.is_empty() || !w.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    h.parse::<u32>().ok().filter(|h| *h > 0)
}

fn is_protocol(field: &str) -> bool {
    field.starts_with("http") || field.starts_with("m3u8") || field == "dash" || field == "f4m" || field == "ism"
}

fn parse_size(field: &str) -> Option<String> {
    let field = field.trim_start_matches(['~', '≈']);
    let starts_numeric = field.chars().next().is_some_and(|c| c.is_ascii_digit());
    (starts_numeric && field.ends_with('B')).then(|| field.to_string())
}

/// Parses one table row. Rows without a resolution or an audio marker yield `None`.
pub fn parse_format_row(line: &str) -> Option<Format> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 || fields[0].starts_with('[') || fields[0].starts_with('-') || fields[0] == "ID" {
        return None;
    }

    let is_audio = line.contains("audio only");
    let ext = fields[1..]
        .iter()
        .find(|f| KNOWN_CONTAINERS.contains(f))
        .map(|f| f.to_string())?;
    let height = if is_audio { 0 } else { fields.iter().find_map(|f| parse_height(f))? };
    let protocol = fields
        .iter()
        .find(|f| is_protocol(f))
        .map(|f| f.to_string())
        .unwrap_or_default();
    let file_size = fields.iter().find_map(|f| parse_size(f));

    Some(Format {
        id: fields[0].to_string(),
        height,
        ext,
        is_audio,
        protocol,
        file_size,
    })
}

fn is_direct(protocol: &str) -> bool {
    protocol == "http" || protocol == "https"
}

/// Whether `candidate` should replace `current` for the same height.
fn prefer(candidate: &Format, current: &Format) -> bool {
    let cand_default = candidate.ext == DEFAULT_CONTAINER;
    let cur_default = current.ext == DEFAULT_CONTAINER;
    if cand_default != cur_default {
        return cand_default;
    }
    if candidate.ext == current.ext {
        return is_direct(&candidate.protocol) && !is_direct(&current.protocol);
    }
    false
}

/// One format per height among video variants, highest first.
pub fn rank_formats(formats: Vec<Format>) -> Catalog {
    let has_audio = formats.iter().any(|f| f.is_audio);
    let mut by_height: BTreeMap<u32, Format> = BTreeMap::new();
    for format in formats.into_iter().filter(|f| !f.is_audio) {
        match by_height.get(&format.height) {
            Some(current) if !prefer(&format, current) => {}
            _ => {
                by_height.insert(format.height, format);
            }
        }
    }
    Catalog {
        video: by_height.into_values().rev().collect(),
        has_audio,
    }
}

pub fn parse_catalog(output: &str) -> Catalog {
    rank_formats(output.lines().filter_map(parse_format_row).collect())
}

pub async fn fetch_catalog(ytdlp: &Path, url: &str, cookie_browser: Option<&str>) -> Result<Catalog> {
    let mut args: Vec<String> = ["--list-formats", "--no-warnings", "--extractor-retries", "2"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Some(browser) = cookie_browser {
        args.push("--cookies-from-browser".into());
        args.push(browser.to_string());
    }
    args.push(url.to_string());

    let out = run_captured(ytdlp, &args).await?;
    if !out.success {
        let text = out.combined.trim();
        warn!(url, "format listing failed");
        if text.is_empty() {
            return Err(AppError::Catalog("yt-dlp exited without output".into()).into());
        }
        return Err(AppError::Catalog(bound_text(text, ERROR_LIMIT)).into());
    }

    let catalog = parse_catalog(&out.stdout);
    debug!(url, heights = ?catalog.video.iter().map(|f| f.height).collect::<Vec<_>>(), "formats resolved");
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
[info] Available formats for dQw4w9WgXcQ:
ID  EXT   RESOLUTION FPS CH |   FILESIZE   TBR PROTO | VCODEC          VBR ACODEC      ABR ASR MORE INFO
---------------------------------------------------------------------------------------------------------
sb0 mhtml 48x27        0    |                  mhtml | images                                  storyboard
140 m4a   audio only      2 |    3.27MiB  129k https | audio only          mp4a.40.2  129k 44k medium, m4a_dash
251 webm  audio only      2 |    3.28MiB  130k https | audio only          opus       130k 48k medium, webm_dash
94  mp4   854x480     25    | ~ 18.66MiB  737k m3u8  | avc1.4d401f  737k video only
135 mp4   854x480     25    |    8.22MiB  325k https | avc1.4d401f  325k video only          480p, mp4_dash
244 webm  854x480     25    |    7.01MiB  277k https | vp9          277k video only          480p, webm_dash
247 webm  1280x720    25    |   13.63MiB  538k https | vp9          538k video only          720p, webm_dash
136 mp4   1280x720    25    |   16.41MiB  648k https | avc1.4d401f  648k video only          720p, mp4_dash
137 mp4   1920x1080   25    |   38.11MiB 1505k https | avc1.640028 1505k video only          1080p, mp4_dash
";

    #[test]
    fn parses_video_row() {
        let f = parse_format_row("137 mp4   1920x1080   25    |   38.11MiB 1505k https | avc1.640028 1505k video only").unwrap();
        assert_eq!(f.id, "137");
        assert_eq!(f.height, 1080);
        assert_eq!(f.ext, "mp4");
        assert_eq!(f.protocol, "https");
        assert_eq!(f.file_size.as_deref(), Some("38.11MiB"));
        assert!(!f.is_audio);
    }

    #[test]
    fn parses_audio_row() {
        let f = parse_format_row("140 m4a   audio only      2 |    3.27MiB  129k https | audio only").unwrap();
        assert!(f.is_audio);
        assert_eq!(f.height, 0);
        assert_eq!(f.ext, "m4a");
    }

    #[test]
    fn discards_headers_and_storyboards() {
        assert_eq!(parse_format_row("ID  EXT   RESOLUTION FPS CH |   FILESIZE"), None);
        assert_eq!(parse_format_row("[info] Available formats for x:"), None);
        assert_eq!(parse_format_row("sb0 mhtml 48x27 0 | mhtml | images storyboard"), None);
        assert_eq!(parse_format_row("-----------"), None);
    }

    #[test]
    fn approximate_sizes_are_kept_without_marker() {
        let f = parse_format_row("94  mp4   854x480     25    | ~ 18.66MiB  737k m3u8  | avc1.4d401f  737k video only").unwrap();
        assert_eq!(f.file_size.as_deref(), Some("18.66MiB"));
        assert_eq!(f.protocol, "m3u8");
    }

    #[test]
    fn ranks_one_format_per_height_highest_first() {
        let catalog = parse_catalog(LISTING);
        let ids: Vec<&str> = catalog.video.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["137", "136", "135"]);
        assert!(catalog.has_audio);
    }

    #[test]
    fn default_container_beats_other_extensions() {
        let webm = Format {
            id: "247".into(),
            height: 720,
            ext: "webm".into(),
            is_audio: false,
            protocol: "https".into(),
            file_size: None,
        };
        let mp4 = Format {
            id: "136".into(),
            ext: "mp4".into(),
            protocol: "m3u8".into(),
            ..webm.clone()
        };
        for order in [vec![webm.clone(), mp4.clone()], vec![mp4.clone(), webm.clone()]] {
            let catalog = rank_formats(order);
            assert_eq!(catalog.video.len(), 1);
            assert_eq!(catalog.video[0].id, "136");
        }
    }

    #[test]
    fn direct_protocol_breaks_extension_ties() {
        let hls = Format {
            id: "94".into(),
            height: 480,
            ext: "mp4".into(),
            is_audio: false,
            protocol: "m3u8".into(),
            file_size: None,
        };
        let direct = Format {
            id: "135".into(),
            protocol: "https".into(),
            ..hls.clone()
        };
        let catalog = rank_formats(vec![hls.clone(), direct.clone()]);
        assert_eq!(catalog.video[0].id, "135");
        let catalog = rank_formats(vec![direct, hls]);
        assert_eq!(catalog.video[0].id, "135");
    }

    #[test]
    fn empty_listing_gives_empty_catalog() {
        let catalog = parse_catalog("[info] nothing here\n");
        assert!(catalog.video.is_empty());
        assert!(!catalog.has_audio);
    }
}
