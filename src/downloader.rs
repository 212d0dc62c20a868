//! The execution engine: builds yt-dlp argument vectors, runs attempts and
//! applies the retry/fallback policy.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

use crate::bridge::{Bridge, ProgressSink};
use crate::parser::{classify_line, SegmentSplitter};
use crate::process::{command, PidSlot};
use crate::types::{AttemptOutcome, CompletionResult, DownloadAttempt, EventKind, ProgressEvent, Selections};
use crate::utils::bound_text;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const FALLBACK_VIDEO_FORMAT: &str = "bestvideo[height<=1080]+bestaudio/best";
const BEST_VIDEO_FORMAT: &str = "bestvideo+bestaudio/best";
const DIAGNOSTIC_LINES: usize = 6;
const REASON_LIMIT: usize = 300;

/// The accelerated transfer helper handed to yt-dlp via `--downloader`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accelerator {
    pub program: String,
    pub args: String,
}

/// Everything that decides one argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub audio_only: bool,
    pub resolution_id: Option<String>,
    pub cookie_browser: Option<String>,
    pub use_accelerator: bool,
    pub fallback: bool,
}

impl ArgSpec {
    pub fn primary(selections: &Selections, use_accelerator: bool) -> Self {
        Self {
            audio_only: selections.audio_only,
            resolution_id: selections.format_id.clone(),
            cookie_browser: selections.cookie_browser.clone(),
            use_accelerator,
            fallback: false,
        }
    }

    /// Audio stays audio; video loses the resolution pick in favour of a capped
    /// selector. The accelerator is kept unless it is suspected of the failure.
    pub fn fallback(&self, drop_accelerator: bool) -> Self {
        Self {
            resolution_id: None,
            use_accelerator: self.use_accelerator && !drop_accelerator,
            fallback: true,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArgBuilder {
    pub output_template: String,
    pub audio_format: String,
    pub accelerator: Option<Accelerator>,
}

impl ArgBuilder {
    pub fn build(&self, spec: &ArgSpec, work_dir: &Path, url: &str) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        push(&["--no-overwrites", "--geo-bypass", "--no-check-certificate"]);
        if spec.fallback {
            push(&["--concurrent-fragments", "16"]);
        } else {
            push(&[
                "--concurrent-fragments", "32",
                "--buffer-size", "64K",
                "--http-chunk-size", "10M",
                "--extractor-retries", "2",
                "--fragment-retries", "3",
            ]);
        }
        push(&["--newline", "--progress", "--no-color", "--no-warnings"]);

        let output = work_dir.join(&self.output_template);
        args.push("--output".into());
        args.push(output.to_string_lossy().to_string());

        if let Some(browser) = &spec.cookie_browser {
            args.push("--cookies-from-browser".into());
            args.push(browser.clone());
        }
        args.push("--user-agent".into());
        args.push(USER_AGENT.into());

        if spec.audio_only {
            args.push("--extract-audio".into());
            args.push("--audio-format".into());
            args.push(self.audio_format.clone());
        } else {
            let selector = match (&spec.resolution_id, spec.fallback) {
                (_, true) => FALLBACK_VIDEO_FORMAT.to_string(),
                (Some(id), false) => format!("{}+bestaudio/best", id),
                (None, false) => BEST_VIDEO_FORMAT.to_string(),
            };
            for item in ["--merge-output-format", "mp4", "--remux-video", "mp4", "--format"] {
                args.push(item.into());
            }
            args.push(selector);
        }

        args.push(url.to_string());

        if spec.use_accelerator {
            if let Some(acc) = &self.accelerator {
                args.push("--downloader".into());
                args.push(acc.program.clone());
                args.push("--downloader-args".into());
                args.push(format!("aria2c:{}", acc.args));
            }
        }
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

/// Whether the helper's own diagnostics show up in a failure.
pub fn accelerator_suspected(diagnostic: Option<&str>) -> bool {
    diagnostic.is_some_and(|d| d.to_ascii_lowercase().contains("aria2"))
}

/// Runs primary attempts `1..=max_retries`, waiting `backoff` between them, then
/// one fallback attempt. `launch` performs a single attempt.
pub async fn run_with_fallback<F, Fut>(
    policy: RetryPolicy,
    primary: &ArgSpec,
    build: impl Fn(&ArgSpec) -> Vec<String>,
    mut launch: F,
) -> CompletionResult
where
    F: FnMut(DownloadAttempt) -> Fut,
    Fut: Future<Output = Result<AttemptOutcome>>,
{
    let max = policy.max_retries.max(1);
    let mut last_diagnostic: Option<String> = None;

    for number in 1..=max {
        let attempt = DownloadAttempt {
            number,
            args: build(primary),
            used_fallback: false,
        };
        match launch(attempt).await {
            Ok(outcome) if outcome.success => {
                info!(attempt = number, "download succeeded");
                return CompletionResult::Success;
            }
            Ok(outcome) => {
                warn!(attempt = number, code = ?outcome.exit_code, "download attempt failed");
                last_diagnostic = outcome.diagnostic.or(last_diagnostic);
            }
            Err(e) => {
                warn!(attempt = number, error = %e, "download attempt could not run");
                last_diagnostic = Some(e.to_string());
            }
        }
        if number < max && !policy.backoff.is_zero() {
            info!(delay = ?policy.backoff, "waiting before retrying");
            tokio::time::sleep(policy.backoff).await;
        }
    }

    let drop_accelerator = accelerator_suspected(last_diagnostic.as_deref());
    let fallback = primary.fallback(drop_accelerator);
    info!(drop_accelerator, "primary attempts exhausted, trying fallback format");
    let attempt = DownloadAttempt {
        number: max + 1,
        args: build(&fallback),
        used_fallback: true,
    };
    match launch(attempt).await {
        Ok(outcome) if outcome.success => return CompletionResult::Success,
        Ok(outcome) => last_diagnostic = outcome.diagnostic.or(last_diagnostic),
        Err(e) => last_diagnostic = Some(e.to_string()),
    }

    let mut reason = format!("all {} download attempts failed, including fallback", max);
    if let Some(detail) = last_diagnostic {
        reason = format!("{}: {}", reason, detail);
    }
    CompletionResult::Failure {
        reason: bound_text(&reason, REASON_LIMIT),
    }
}

/// Reads one output stream, classifying every segment. Returns the last few
/// lines that were not progress, for failure reports.
async fn pump_stream<R: AsyncRead + Unpin>(mut reader: R, sink: ProgressSink) -> VecDeque<String> {
    let mut splitter = SegmentSplitter::new();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_LINES);
    let mut chunk = [0u8; 8192];

    let handle = |line: String, tail: &mut VecDeque<String>| {
        let event = classify_line(&line);
        let is_progress = matches!(&event, Some(e) if e.kind == EventKind::Progress);
        if let Some(event) = event {
            sink.send(event);
        }
        if !is_progress && !line.trim().is_empty() {
            if tail.len() == DIAGNOSTIC_LINES {
                tail.pop_front();
            }
            tail.push_back(line.trim().to_string());
        }
    };

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&chunk[..n]) {
                    handle(line, &mut tail);
                }
            }
        }
    }
    if let Some(line) = splitter.finish() {
        handle(line, &mut tail);
    }
    tail
}

/// The latest `ERROR:` line, stderr first; otherwise the last stderr line.
fn pick_diagnostic(err_tail: &VecDeque<String>, out_tail: &VecDeque<String>) -> Option<String> {
    err_tail
        .iter()
        .rev()
        .chain(out_tail.iter().rev())
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| err_tail.back())
        .cloned()
}

pub struct Engine {
    pub program: PathBuf,
    pub builder: ArgBuilder,
    pub policy: RetryPolicy,
}

impl Engine {
    pub fn accelerator_enabled(&self) -> bool {
        self.builder.accelerator.is_some()
    }

    pub async fn run(&self, selections: &Selections, work_dir: &Path, bridge: &Bridge, pid: &PidSlot) -> CompletionResult {
        let primary = ArgSpec::primary(selections, self.accelerator_enabled());
        info!(url = %selections.url, work_dir = %work_dir.display(), "starting download");
        run_with_fallback(
            self.policy,
            &primary,
            |spec| self.builder.build(spec, work_dir, &selections.url),
            |attempt| self.launch(attempt, bridge, pid),
        )
        .await
    }

    async fn launch(&self, attempt: DownloadAttempt, bridge: &Bridge, pid: &PidSlot) -> Result<AttemptOutcome> {
        let sink = bridge.progress_sink(attempt.number, attempt.used_fallback);
        sink.send(ProgressEvent {
            kind: EventKind::Info,
            line: if attempt.used_fallback {
                "Retrying with fallback format...".to_string()
            } else {
                format!("Starting download (attempt {})...", attempt.number)
            },
            percent: 0.0,
            speed: None,
            eta: None,
        });

        let mut child = command(&self.program)
            .args(&attempt.args)
            .env("PYTHONUNBUFFERED", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program.display()))?;
        *pid.lock() = child.id();

        let stdout = child.stdout.take().context("stdout was not captured")?;
        let stderr = child.stderr.take().context("stderr was not captured")?;
        let out_task = tokio::spawn(pump_stream(stdout, sink.clone()));
        let err_task = tokio::spawn(pump_stream(stderr, sink));

        let status = child.wait().await;
        *pid.lock() = None;
        let out_tail = out_task.await.unwrap_or_default();
        let err_tail = err_task.await.unwrap_or_default();
        let status = status?;

        Ok(AttemptOutcome {
            success: status.success(),
            exit_code: status.code(),
            diagnostic: pick_diagnostic(&err_tail, &out_tail),
        })
    }
}
