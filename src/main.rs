mod app;
mod bridge;
mod catalog;
mod config;
mod deps;
mod downloader;
mod logging;
mod metadata;
mod parser;
mod process;
mod session;
mod tui;
mod types;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use console::{style, Term};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

use app::{App, RunSummary, Services};
use config::*;
use downloader::{Accelerator, ArgBuilder, Engine, RetryPolicy};
use session::{Outcome, Session};
use utils::{settle_work_dir, Settled};

const VERSION: &str = env!("CARGO_PKG_VERSION");

async fn run_app(cli: &Cli, term: &Term) -> Result<()> {
    term.write_line(&format!(
        "{} {}",
        style("yaria, a terminal front-end for yt-dlp").bold().blue(),
        style(format!("(v{})", VERSION)).dim()
    ))?;

    let config_dir = get_config_dir()?;
    let config_file = config_dir.join(SETTINGS_FILE);
    let mut settings = load_settings_from(&config_file);
    cli.apply(&mut settings);
    if cli.save_settings {
        save_settings(&config_file, &settings)?;
        term.write_line(&format!("Settings saved to {}", style(config_file.display()).cyan()))?;
    }

    if let Some(path) = logging::init_logging(cli) {
        term.write_line(&format!("Logging to {}", style(path.display()).cyan()))?;
    }
    info!(version = VERSION, "starting");

    let resolved = deps::resolve_ytdlp(&settings.ytdlp_path, &config_dir, term).await?;
    if resolved.config_needs_update {
        settings.ytdlp_path = resolved.path.to_string_lossy().to_string();
        save_settings(&config_file, &settings)?;
        term.write_line(&format!("Config updated with yt-dlp path: {}", style(&settings.ytdlp_path).cyan()))?;
    }
    term.write_line(&format!("Using yt-dlp: {}", style(resolved.path.display()).cyan()))?;

    let accelerator = if settings.use_aria2c {
        match deps::resolve_aria2c(&settings.aria2c_path, &config_dir).await {
            Some(path) => Some(Accelerator {
                program: path.to_string_lossy().to_string(),
                args: settings.aria2c_args.clone(),
            }),
            None => {
                term.write_line(&format!("{}", style("aria2c not found, using the built-in downloader.").yellow()))?;
                None
            }
        }
    } else {
        None
    };

    let output_dir = cli.output_dir();
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let engine = Engine {
        program: resolved.path.clone(),
        builder: ArgBuilder {
            output_template: settings.output_template.clone(),
            audio_format: settings.audio_format.clone(),
            accelerator,
        },
        policy: RetryPolicy {
            max_retries: settings.max_retries,
            backoff: Duration::from_secs(settings.retry_delay),
        },
    };
    let services = Services {
        ytdlp: resolved.path,
        engine: Arc::new(engine),
        output_dir: output_dir.clone(),
    };

    let session = Session::new(settings.cookie_browser.clone()).prefer_audio(cli.audio_only);
    let (session, initial) = match &cli.url {
        Some(url) => session.with_url(url),
        None => (session, None),
    };
    let mut app = App::new(session, initial, Handle::current(), services);

    let (app, ui_result) = tokio::task::spawn_blocking(move || {
        let result = tui::run_tui(&mut app);
        (app, result)
    })
    .await?;

    let summary = app.finish();
    let settled = finish_download(summary, &output_dir, term).await;
    ui_result?;
    settled
}

/// Waits for the download task to wind down, then moves or removes its output.
async fn finish_download(summary: RunSummary, output_dir: &Path, term: &Term) -> Result<()> {
    if let Some(task) = summary.download {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("download task did not stop in time");
        }
    }

    let success = summary.outcome == Outcome::Success;
    if let Some(work_dir) = &summary.work_dir {
        let keep_dir = summary.selections.playlist.is_some();
        match settle_work_dir(work_dir, output_dir, success, keep_dir).context("Failed to tidy up the download")? {
            Settled::Moved(path) => {
                term.write_line(&format!("Saved to {}", style(path.display()).cyan()))?;
            }
            Settled::Kept(dir) => {
                term.write_line(&format!("Saved in {}", style(dir.display()).cyan()))?;
            }
            Settled::Removed => {}
        }
    }

    match &summary.outcome {
        Outcome::Success => term.write_line(&format!("{}", style("Download completed!").bold().green()))?,
        Outcome::Cancelled => term.write_line(&format!("{}", style("Cancelled.").yellow()))?,
        Outcome::Failed(reason) => term.write_line(&format!("{}", style(format!("Download failed: {}", reason)).red()))?,
        Outcome::Error(message) => term.write_line(&format!("{}", style(message).red()))?,
        Outcome::AlreadyDownloaded(path) => term.write_line(&format!(
            "File already downloaded: {}",
            style(path.display()).cyan()
        ))?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let term = Term::stdout();
    if let Err(e) = run_app(&cli, &term).await {
        let _ = term.write_line(&format!("\n{}\n", style(format!("An unexpected error occurred: {:#}", e)).red()));
        std::process::exit(1);
    }
    Ok(())
}
