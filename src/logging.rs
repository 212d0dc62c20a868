use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::Cli;

pub fn log_path(cli: &Cli) -> PathBuf {
    cli.log_file
        .clone()
        .unwrap_or_else(|| env::temp_dir().join("yaria.log"))
}

// Trace level keeps the per-line classifier decisions.
fn file_subscriber<W>(writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(writer)
        .finish()
}

/// Installs a file subscriber when logging was requested. The TUI owns the
/// terminal, so nothing is ever written to stdout or stderr.
pub fn init_logging(cli: &Cli) -> Option<PathBuf> {
    if !cli.logging_enabled() {
        return None;
    }
    let path = log_path(cli);
    let file = OpenOptions::new().create(true).append(true).open(&path).ok()?;
    tracing::subscriber::set_global_default(file_subscriber(Mutex::new(file))).ok()?;
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_subscriber_keeps_trace_events() {
        let subscriber = file_subscriber(Mutex::new(Vec::<u8>::new()));
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(tracing::Level::TRACE));
            assert!(tracing::enabled!(tracing::Level::DEBUG));
        });
    }
}
