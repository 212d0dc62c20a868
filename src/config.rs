use anyhow::{anyhow, Result};
use clap::Parser;
use ini::Ini;
use std::fs;
use std::path::{Path, PathBuf};
use crate::types::Settings;

pub const SETTINGS_FILE: &str = "settings.ini";

pub const DEFAULT_ARIA2C_ARGS: &str = "--max-connection-per-server=16 --min-split-size=1M --split=32 \
--max-concurrent-downloads=16 --file-allocation=none --optimize-concurrent-downloads=true --disk-cache=64M \
--max-tries=5 --retry-wait=2 --timeout=30 --connect-timeout=30 --lowest-speed-limit=10K --continue=true \
--allow-overwrite=true --allow-piece-length-change=true --enable-rpc=false --enable-http-pipelining=true \
--enable-http-keep-alive=true --enable-mmap=true --enable-color=false --summary-interval=0 --log-level=error \
--console-log-level=error";

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: 5,
            use_aria2c: true,
            aria2c_args: DEFAULT_ARIA2C_ARGS.to_string(),
            output_template: "%(title)s.%(ext)s".to_string(),
            audio_format: "mp3".to_string(),
            cookie_browser: None,
            ytdlp_path: "yt-dlp".to_string(),
            aria2c_path: "aria2c".to_string(),
        }
    }
}

/// Interactive terminal front-end for yt-dlp.
#[derive(Debug, Parser, Clone)]
#[command(name = "yaria", author, version)]
pub struct Cli {
    /// Video or playlist URL; prompted for when omitted
    pub url: Option<String>,

    /// Browser to read cookies from for sign-in restricted videos
    #[arg(long, env = "YARIA_BROWSER")]
    pub browser: Option<String>,

    /// Put the cursor on "Audio only" when choosing the format
    #[arg(long)]
    pub audio_only: bool,

    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Seconds to wait between attempts
    #[arg(long, value_name = "SECS")]
    pub retry_delay: Option<u64>,

    /// Never hand transfers to aria2c
    #[arg(long)]
    pub no_aria2: bool,

    /// Where finished downloads end up (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Write a trace log to the temp directory
    #[arg(long)]
    pub logs: bool,

    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Persist the merged settings before starting
    #[arg(long)]
    pub save_settings: bool,
}

impl Cli {
    /// Command-line values win over the settings file.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(browser) = &self.browser {
            settings.cookie_browser = Some(browser.clone());
        }
        if let Some(n) = self.max_retries {
            settings.max_retries = n;
        }
        if let Some(secs) = self.retry_delay {
            settings.retry_delay = secs;
        }
        if self.no_aria2 {
            settings.use_aria2c = false;
        }
        settings.max_retries = settings.max_retries.max(1);
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn logging_enabled(&self) -> bool {
        self.logs || self.log_file.is_some()
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let path = if cfg!(windows) {
        dirs_next::data_local_dir()
            .ok_or_else(|| anyhow!("Could not find local app data directory"))?
            .join("yaria")
    } else {
        dirs_next::config_dir()
            .ok_or_else(|| anyhow!("Could not find config directory"))?
            .join("yaria")
    };
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Missing or unparsable values fall back to their defaults.
pub fn load_settings(conf: &Ini) -> Settings {
    let defaults = Settings::default();
    let section = conf.section(Some("Settings"));
    let text = |key: &str| section.and_then(|s| s.get(key)).map(str::trim);

    let max_retries = text("max_retries")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(defaults.max_retries)
        .max(1);
    let retry_delay = text("retry_delay")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(defaults.retry_delay);
    let use_aria2c = text("use_aria2c")
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(defaults.use_aria2c);
    let non_empty = |key: &str, fallback: String| {
        text(key)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or(fallback)
    };

    Settings {
        max_retries,
        retry_delay,
        use_aria2c,
        aria2c_args: non_empty("aria2c_args", defaults.aria2c_args),
        output_template: non_empty("output_template", defaults.output_template),
        audio_format: non_empty("audio_format", defaults.audio_format),
        cookie_browser: text("cookie_browser").filter(|v| !v.is_empty()).map(str::to_string),
        ytdlp_path: non_empty("ytdlp_path", defaults.ytdlp_path),
        aria2c_path: non_empty("aria2c_path", defaults.aria2c_path),
    }
}

pub fn load_settings_from(config_file: &Path) -> Settings {
    let conf = Ini::load_from_file(config_file).unwrap_or_default();
    load_settings(&conf)
}

pub fn save_settings(config_file: &Path, settings: &Settings) -> Result<()> {
    let mut conf = Ini::new();
    conf.with_section(Some("Settings"))
        .set("max_retries", settings.max_retries.to_string())
        .set("retry_delay", settings.retry_delay.to_string())
        .set("use_aria2c", settings.use_aria2c.to_string())
        .set("aria2c_args", settings.aria2c_args.as_str())
        .set("output_template", settings.output_template.as_str())
        .set("audio_format", settings.audio_format.as_str())
        .set("cookie_browser", settings.cookie_browser.as_deref().unwrap_or(""))
        .set("ytdlp_path", settings.ytdlp_path.as_str())
        .set("aria2c_path", settings.aria2c_path.as_str());
    conf.write_to_file(config_file)?;
    Ok(())
}
