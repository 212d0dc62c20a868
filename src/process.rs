use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// PID of the download currently running, shared with the UI loop so an
/// interrupt can reach it.
pub type PidSlot = Arc<Mutex<Option<u32>>>;

/// Output of a short-lived tool invocation, both streams merged.
#[derive(Debug, Clone)]
pub struct Captured {
    pub success: bool,
    pub stdout: String,
    pub combined: String,
}

pub fn command(program: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

pub async fn run_captured(program: &Path, args: &[String]) -> Result<Captured> {
    let output = command(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", program.display()))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = if stderr.trim().is_empty() {
        stdout.clone()
    } else if stdout.trim().is_empty() {
        stderr.to_string()
    } else {
        format!("{}\n{}", stdout.trim_end(), stderr)
    };
    Ok(Captured {
        success: output.status.success(),
        stdout,
        combined,
    })
}

/// Terminates the process group led by `pid`. Children are spawned as group
/// leaders, so this also reaches the aria2c helper yt-dlp starts.
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(windows)]
    {
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()?;
    }
    #[cfg(unix)]
    {
        nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        )?;
    }
    Ok(())
}

/// Kills whatever the slot currently points at, if anything.
pub fn kill_slot(slot: &PidSlot) -> Result<()> {
    match slot.lock().take() {
        Some(pid) => kill_process(pid),
        None => Ok(()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn captures_both_streams() {
        let out = run_captured(
            &PathBuf::from("sh"),
            &["-c".to_string(), "echo out; echo err 1>&2; exit 3".to_string()],
        )
        .await
        .unwrap();
        assert!(!out.success);
        assert_eq!(out.stdout.trim(), "out");
        assert!(out.combined.contains("out"));
        assert!(out.combined.contains("err"));
    }

    #[test]
    fn empty_slot_is_a_no_op() {
        let slot: PidSlot = Arc::new(Mutex::new(None));
        assert!(kill_slot(&slot).is_ok());
    }

    #[tokio::test]
    async fn kill_slot_terminates_the_group() {
        let mut child = command(Path::new("sh"))
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        let slot: PidSlot = Arc::new(Mutex::new(child.id()));
        kill_slot(&slot).unwrap();
        assert!(slot.lock().is_none());

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
