//! Runs the session's commands on the tokio runtime and feeds their results
//! back through the bridge.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{self, Bridge, Inbox};
use crate::catalog::fetch_catalog;
use crate::downloader::Engine;
use crate::metadata::{detect_browsers, existing_download, fetch_metadata, predict_filename};
use crate::process::{kill_slot, PidSlot};
use crate::session::{Command, Event, Outcome, Screen, Session, View};
use crate::types::{CompletionResult, Selections};
use crate::utils::{create_unique_dir, dir_name_for};

pub struct Services {
    pub ytdlp: PathBuf,
    pub engine: Arc<Engine>,
    pub output_dir: PathBuf,
}

/// What is left to do once the UI has exited.
pub struct RunSummary {
    pub outcome: Outcome,
    pub selections: Selections,
    pub work_dir: Option<PathBuf>,
    pub download: Option<JoinHandle<()>>,
}

pub struct App {
    session: Session,
    bridge: Bridge,
    inbox: Inbox,
    runtime: Handle,
    services: Services,
    pid: PidSlot,
    work_dir: Option<PathBuf>,
    download: Option<JoinHandle<()>>,
}

impl App {
    pub fn new(session: Session, initial: Option<Command>, runtime: Handle, services: Services) -> Self {
        let (bridge, inbox) = bridge::channel();
        let mut app = Self {
            session,
            bridge,
            inbox,
            runtime,
            services,
            pid: PidSlot::default(),
            work_dir: None,
            download: None,
        };
        if let Some(command) = initial {
            app.dispatch(command);
        }
        app
    }

    pub fn view(&self) -> View<'_> {
        self.session.view()
    }

    pub fn screen(&self) -> &Screen {
        self.session.screen()
    }

    pub fn is_finished(&self) -> bool {
        self.session.screen().is_terminal()
    }

    pub fn handle_event(&mut self, event: Event) {
        if matches!(event, Event::Interrupt) {
            self.cancel_download();
        }
        if let Some(command) = self.session.handle(event) {
            self.dispatch(command);
        }
    }

    /// Applies everything the background tasks have reported since the last tick.
    pub fn tick(&mut self) {
        for event in self.inbox.drain() {
            self.handle_event(event);
        }
    }

    fn cancel_download(&mut self) {
        if let Err(e) = kill_slot(&self.pid) {
            warn!(error = %e, "failed to terminate download");
        }
        if let Some(task) = &self.download {
            task.abort();
        }
    }

    fn dispatch(&mut self, command: Command) {
        let bridge = self.bridge.clone();
        let ytdlp = self.services.ytdlp.clone();
        match command {
            Command::FetchMetadata { url, cookie_browser } => {
                let output_dir = self.services.output_dir.clone();
                let template = self.services.engine.builder.output_template.clone();
                self.runtime.spawn(async move {
                    let result = fetch_metadata(&ytdlp, &url, cookie_browser.as_deref()).await;
                    if matches!(&result, Ok(m) if m.playlist.is_none()) {
                        match predict_filename(&ytdlp, &url, cookie_browser.as_deref(), &template).await {
                            Ok(name) => {
                                if let Some(path) = existing_download(&output_dir, &name) {
                                    info!(path = %path.display(), "file already downloaded");
                                    bridge.post(Event::AlreadyDownloaded(path)).await;
                                    return;
                                }
                                debug!(%name, "predicted output file is not there yet");
                            }
                            Err(e) => warn!(error = %e, "failed to predict the output file name"),
                        }
                    }
                    bridge.post(Event::MetadataLoaded(result)).await;
                });
            }
            Command::DetectBrowsers => {
                self.runtime.spawn(async move {
                    bridge.post(Event::BrowsersDetected(detect_browsers().await)).await;
                });
            }
            Command::FetchFormats { url, cookie_browser } => {
                self.runtime.spawn(async move {
                    let result = fetch_catalog(&ytdlp, &url, cookie_browser.as_deref())
                        .await
                        .map_err(|e| format!("{:#}", e));
                    bridge.post(Event::FormatsLoaded(result)).await;
                });
            }
            Command::StartDownload(selections) => self.start_download(selections),
        }
    }

    fn start_download(&mut self, selections: Selections) {
        let name = match &selections.playlist {
            Some(playlist) => dir_name_for(&playlist.title, "Playlist"),
            None => dir_name_for(&selections.title, "Video"),
        };
        let work_dir = match create_unique_dir(&self.services.output_dir.join(name)) {
            Ok(dir) => dir,
            Err(e) => {
                error!(error = %e, "could not create working directory");
                self.handle_event(Event::Completed(CompletionResult::Failure {
                    reason: format!("{:#}", e),
                }));
                return;
            }
        };
        info!(work_dir = %work_dir.display(), "download dispatched");
        self.work_dir = Some(work_dir.clone());

        let engine = self.services.engine.clone();
        let bridge = self.bridge.clone();
        let pid = self.pid.clone();
        self.download = Some(self.runtime.spawn(async move {
            let result = engine.run(&selections, &work_dir, &bridge, &pid).await;
            bridge.complete(result).await;
        }));
    }

    pub fn finish(self) -> RunSummary {
        let outcome = match self.session.screen() {
            Screen::Terminal(outcome) => outcome.clone(),
            _ => Outcome::Cancelled,
        };
        RunSummary {
            outcome,
            selections: self.session.selections(),
            work_dir: self.work_dir,
            download: self.download,
        }
    }
}
