use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0} is required but could not be found")]
    MissingTool(String),
    #[error("{0}")]
    Catalog(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    AuthRequired,
    RateLimited,
    Unsupported,
    Unavailable,
    NoFormats,
    Other,
}

/// A failed metadata query. `message` is the tool's own diagnostic text, bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataError {
    pub kind: MetadataErrorKind,
    pub message: String,
}

impl MetadataError {
    pub fn is_auth_required(&self) -> bool {
        self.kind == MetadataErrorKind::AuthRequired
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hint = match self.kind {
            MetadataErrorKind::AuthRequired => "Sign-in or age check required: ",
            MetadataErrorKind::RateLimited => "Rate limited, try again later: ",
            MetadataErrorKind::Unsupported => "Invalid or unsupported URL: ",
            MetadataErrorKind::Unavailable => "Video unavailable: ",
            MetadataErrorKind::NoFormats => "No downloadable formats: ",
            MetadataErrorKind::Other => "",
        };
        write!(f, "{}{}", hint, self.message)
    }
}

impl std::error::Error for MetadataError {}

/// One downloadable variant offered by yt-dlp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub id: String,
    pub height: u32,
    pub ext: String,
    pub is_audio: bool,
    pub protocol: String,
    pub file_size: Option<String>,
}

impl Format {
    pub fn label(&self) -> String {
        let protocol = if self.protocol.is_empty() { "?" } else { &self.protocol };
        match &self.file_size {
            Some(size) => format!("{}p ({}, {}) - {}", self.height, self.ext, protocol, size),
            None => format!("{}p ({}, {})", self.height, self.ext, protocol),
        }
    }
}

/// Ranked video formats, highest first, plus whether audio-only variants exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub video: Vec<Format>,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub title: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub title: String,
    pub playlist: Option<Playlist>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Advances the progress bar.
    Progress,
    /// Display only; the percent is always zero.
    Info,
}

/// A normalized sample derived from one output line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub line: String,
    pub percent: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

/// A progress event stamped with the attempt that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub attempt: u32,
    pub used_fallback: bool,
    pub event: ProgressEvent,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub raw_line: String,
    pub percent: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub attempt: u32,
    pub used_fallback: bool,
}

/// What the user picked, handed from the session to the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selections {
    pub url: String,
    pub title: String,
    pub playlist: Option<Playlist>,
    pub audio_only: bool,
    pub format_id: Option<String>,
    pub cookie_browser: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadAttempt {
    pub number: u32,
    pub args: Vec<String>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    Success,
    Failure { reason: String },
}

/// Persistent settings, stored in `settings.ini`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub max_retries: u32,
    /// Seconds between primary attempts.
    pub retry_delay: u64,
    pub use_aria2c: bool,
    pub aria2c_args: String,
    pub output_template: String,
    pub audio_format: String,
    pub cookie_browser: Option<String>,
    pub ytdlp_path: String,
    pub aria2c_path: String,
}
