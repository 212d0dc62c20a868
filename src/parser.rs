//! Progress line classification for yt-dlp and aria2c output.
//!
//! yt-dlp and its aria2c helper report progress in several incompatible shapes:
//!
//! * `[download]  45.2% of 123.45MiB at 1.23MiB/s ETA 01:23` (explicit percentage)
//! * `[#abc123 45.2MiB/123.45MiB(36%) CN:16 DL:1.2MiB ETA:1m23s]` (parenthesized)
//! * `[#abc123 1.0MiB/89MiB CN:16]` (byte pair only)
//!
//! The percentage matchers run in a fixed order and the first hit wins. Every
//! explicit-percentage matcher comes before the byte-pair matcher, since a line
//! that carries a percentage may also carry a byte pair as extra detail.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::trace;

use crate::types::{EventKind, ProgressEvent};

lazy_static! {
    static ref DOWNLOAD_PERCENT_RE: Regex = Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").unwrap();
    static ref PERCENT_OF_RE: Regex = Regex::new(r"(?:^|\s)(\d+(?:\.\d+)?)%\s+of\s").unwrap();
    static ref PAREN_PERCENT_RE: Regex = Regex::new(r"\((\d+(?:\.\d+)?)%\)").unwrap();
    static ref ARIA2_STATUS_RE: Regex = Regex::new(r"^\s*\[#\w+\s").unwrap();
    static ref BYTE_PAIR_RE: Regex =
        Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*([kKmMgGtT]?i?B)/([0-9]+(?:\.[0-9]+)?)\s*([kKmMgGtT]?i?B)").unwrap();
    static ref SPEED_RE: Regex =
        Regex::new(r"(?:DL:|\bat\s+)(\d+(?:\.\d+)?\s?[kKmMgGtT]?i?B(?:/s)?)").unwrap();
    static ref ETA_RE: Regex = Regex::new(r"ETA[:\s]+([0-9A-Za-z:]+)").unwrap();
}

const INFO_MARKERS: [&str; 5] = ["[download]", "[info]", "Destination:", "[Merger]", "[ExtractAudio]"];

/// Lines naming an output file. Whatever digits the file name carries, they are never progress.
const OUTPUT_FILE_MARKERS: [&str; 3] = ["Destination:", "[Merger]", "[ExtractAudio]"];

/// Longest line the splitter buffers before flushing it as is.
const MAX_LINE: usize = 1024 * 1024;

type PercentMatcher = fn(&str) -> Option<f64>;

/// Evaluated top to bottom; the first matcher returning a value decides the percent.
const PERCENT_MATCHERS: [(&str, PercentMatcher); 4] = [
    ("download-percent", download_percent),
    ("percent-of", percent_of),
    ("parenthesized", parenthesized_percent),
    ("byte-pair", byte_pair_percent),
];

fn capture_f64(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn download_percent(line: &str) -> Option<f64> {
    capture_f64(&DOWNLOAD_PERCENT_RE, line)
}

fn percent_of(line: &str) -> Option<f64> {
    capture_f64(&PERCENT_OF_RE, line)
}

// The two aria2c shapes only count on aria2c's own `[#gid ...]` status lines.
fn parenthesized_percent(line: &str) -> Option<f64> {
    if !ARIA2_STATUS_RE.is_match(line) {
        return None;
    }
    capture_f64(&PAREN_PERCENT_RE, line)
}

fn byte_pair_percent(line: &str) -> Option<f64> {
    if !ARIA2_STATUS_RE.is_match(line) {
        return None;
    }
    let caps = BYTE_PAIR_RE.captures(line)?;
    let (current, total) = byte_pair(&caps)?;
    if total <= 0.0 {
        return None;
    }
    Some(current / total * 100.0)
}

fn byte_pair(caps: &Captures) -> Option<(f64, f64)> {
    let current: f64 = caps.get(1)?.as_str().parse().ok()?;
    let total: f64 = caps.get(3)?.as_str().parse().ok()?;
    let current = current * unit_multiplier(caps.get(2)?.as_str());
    let total = total * unit_multiplier(caps.get(4)?.as_str());
    Some((current, total))
}

/// Plain units are decimal, `i` units are binary.
pub fn unit_multiplier(unit: &str) -> f64 {
    match unit.to_ascii_uppercase().as_str() {
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KIB" => 1024.0,
        "MIB" => 1024.0 * 1024.0,
        "GIB" => 1024.0 * 1024.0 * 1024.0,
        "TIB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

fn capture_str(re: &Regex, line: &str) -> Option<String> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Maps one output line to at most one progress event.
pub fn classify_line(line: &str) -> Option<ProgressEvent> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return None;
    }

    let names_output_file = OUTPUT_FILE_MARKERS.iter().any(|m| line.contains(m));
    let percent = PERCENT_MATCHERS
        .iter()
        .filter(|_| !names_output_file)
        .find_map(|(name, matcher)| matcher(line).map(|p| (*name, p)))
        .filter(|(_, p)| p.is_finite())
        .map(|(name, p)| {
            trace!(matcher = name, percent = p, "progress line matched");
            p
        });

    match percent {
        Some(percent) => Some(ProgressEvent {
            kind: EventKind::Progress,
            line: line.to_string(),
            percent: percent.clamp(0.0, 100.0),
            speed: capture_str(&SPEED_RE, line),
            eta: capture_str(&ETA_RE, line),
        }),
        None if INFO_MARKERS.iter().any(|m| line.contains(m)) => Some(ProgressEvent {
            kind: EventKind::Info,
            line: line.to_string(),
            percent: 0.0,
            speed: None,
            eta: None,
        }),
        None => None,
    }
}

/// Splits a byte stream into lines terminated by `\n`, `\r` or `\r\n`.
///
/// A bare `\r` ends a line on its own because yt-dlp and aria2c redraw one
/// terminal line in place. A line that grows past the limit is flushed early.
#[derive(Debug)]
pub struct SegmentSplitter {
    buf: Vec<u8>,
    skip_lf: bool,
    limit: usize,
}

impl SegmentSplitter {
    pub fn new() -> Self {
        Self::with_limit(MAX_LINE)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            skip_lf: false,
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => lines.push(self.take()),
                b'\r' => {
                    lines.push(self.take());
                    self.skip_lf = true;
                }
                _ => {
                    if self.buf.len() >= self.limit {
                        lines.push(self.take());
                    }
                    self.buf.push(byte);
                }
            }
        }
        lines
    }

    /// Whatever is left once the stream hits EOF.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).to_string();
        self.buf.clear();
        line
    }
}
