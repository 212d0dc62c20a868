//! The session state machine.
//!
//! `Session::handle` is a total function of (screen, event). It never performs
//! I/O: when a transition needs background work it returns a [`Command`], and
//! the runtime executes it and feeds the result back as another [`Event`]. A
//! command is only returned on entry into the screen that waits for it, so at
//! most one query is ever in flight.

use std::path::PathBuf;
use tracing::debug;

use crate::types::{
    Catalog, CompletionResult, EventKind, Format, Metadata, MetadataError, Playlist, ProgressSnapshot,
    ProgressUpdate, Selections,
};

pub const VIDEO_CHOICE: &str = "Video (with audio)";
pub const AUDIO_CHOICE: &str = "Audio only";
pub const DEFAULT_RESOLUTION_CHOICE: &str = "Default (best available)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(String),
    Cancelled,
    Error(String),
    /// The file is already in the output directory; nothing was downloaded.
    AlreadyDownloaded(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    UrlInput,
    MetadataLoading,
    BrowserDetection,
    BrowserSelection,
    FormatChoice,
    FormatsLoading,
    ResolutionChoice,
    Confirmation,
    Downloading,
    Terminal(Outcome),
}

impl Screen {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Screen::Terminal(_))
    }

    fn has_choices(&self) -> bool {
        matches!(self, Screen::BrowserSelection | Screen::FormatChoice | Screen::ResolutionChoice)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Char(char),
    Backspace,
    Previous,
    Next,
    Select,
    Accept,
    Decline,
    Interrupt,
    MetadataLoaded(Result<Metadata, MetadataError>),
    AlreadyDownloaded(PathBuf),
    BrowsersDetected(Vec<String>),
    FormatsLoaded(Result<Catalog, String>),
    Progress(ProgressUpdate),
    Completed(CompletionResult),
}

/// Background work the runtime must start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FetchMetadata { url: String, cookie_browser: Option<String> },
    DetectBrowsers,
    FetchFormats { url: String, cookie_browser: Option<String> },
    StartDownload(Selections),
}

/// Read-only projection of the session for the presentation layer.
#[derive(Debug, Clone)]
pub struct View<'a> {
    pub screen: &'a Screen,
    pub url_input: &'a str,
    pub url: &'a str,
    pub title: &'a str,
    pub playlist: Option<&'a Playlist>,
    pub choices: &'a [String],
    pub cursor: usize,
    pub audio_only: bool,
    pub format_label: Option<String>,
    pub cookie_browser: Option<&'a str>,
    pub snapshot: &'a ProgressSnapshot,
}

#[derive(Debug, Clone)]
pub struct Session {
    screen: Screen,
    url_input: String,
    url: String,
    title: String,
    playlist: Option<Playlist>,
    audio_only: bool,
    selected_format: Option<Format>,
    cookie_browser: Option<String>,
    choices: Vec<String>,
    cursor: usize,
    formats: Vec<Format>,
    snapshot: ProgressSnapshot,
    prefer_audio: bool,
}

impl Session {
    pub fn new(cookie_browser: Option<String>) -> Self {
        Self {
            screen: Screen::UrlInput,
            url_input: String::new(),
            url: String::new(),
            title: String::new(),
            playlist: None,
            audio_only: false,
            selected_format: None,
            cookie_browser,
            choices: Vec::new(),
            cursor: 0,
            formats: Vec::new(),
            snapshot: ProgressSnapshot::default(),
            prefer_audio: false,
        }
    }

    /// Puts the format cursor on "Audio only" instead of video.
    pub fn prefer_audio(mut self, prefer: bool) -> Self {
        self.prefer_audio = prefer;
        self
    }

    /// Starts past the URL screen, as if `url` had just been submitted.
    pub fn with_url(self, url: &str) -> (Self, Option<Command>) {
        let mut session = self;
        session.url_input = url.to_string();
        let command = session.handle(Event::Select);
        (session, command)
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn view(&self) -> View<'_> {
        View {
            screen: &self.screen,
            url_input: &self.url_input,
            url: &self.url,
            title: &self.title,
            playlist: self.playlist.as_ref(),
            choices: &self.choices,
            cursor: self.cursor,
            audio_only: self.audio_only,
            format_label: self.selected_format.as_ref().map(Format::label),
            cookie_browser: self.cookie_browser.as_deref(),
            snapshot: &self.snapshot,
        }
    }

    pub fn handle(&mut self, event: Event) -> Option<Command> {
        if self.screen.is_terminal() {
            return None;
        }
        if matches!(event, Event::Interrupt) {
            self.enter(Screen::Terminal(Outcome::Cancelled));
            return None;
        }
        if matches!(event, Event::Previous | Event::Next) {
            self.navigate(&event);
            return None;
        }

        match (self.screen.clone(), event) {
            (Screen::UrlInput, Event::Char(c)) => {
                self.url_input.push(c);
                None
            }
            (Screen::UrlInput, Event::Backspace) => {
                self.url_input.pop();
                None
            }
            (Screen::UrlInput, Event::Select) => self.submit_url(),
            (Screen::MetadataLoading, Event::MetadataLoaded(result)) => self.on_metadata(result),
            (Screen::MetadataLoading, Event::AlreadyDownloaded(path)) => {
                self.enter(Screen::Terminal(Outcome::AlreadyDownloaded(path)));
                None
            }
            (Screen::BrowserDetection, Event::BrowsersDetected(browsers)) => {
                if browsers.is_empty() {
                    self.enter(Screen::Terminal(Outcome::Error(
                        "Age-restricted video. No supported browsers found for authentication.".into(),
                    )));
                } else {
                    self.show_choices(Screen::BrowserSelection, browsers);
                }
                None
            }
            (Screen::BrowserSelection, Event::Select) => {
                let browser = self.choices.get(self.cursor).cloned()?;
                self.cookie_browser = Some(browser);
                self.enter(Screen::MetadataLoading);
                Some(self.fetch_metadata())
            }
            (Screen::FormatChoice, Event::Select) => {
                if self.cursor == 0 {
                    self.audio_only = false;
                    self.enter(Screen::FormatsLoading);
                    Some(Command::FetchFormats {
                        url: self.url.clone(),
                        cookie_browser: self.cookie_browser.clone(),
                    })
                } else {
                    self.audio_only = true;
                    self.selected_format = None;
                    self.enter(Screen::Confirmation);
                    None
                }
            }
            (Screen::FormatsLoading, Event::FormatsLoaded(result)) => {
                match result {
                    Ok(catalog) if catalog.video.is_empty() => {
                        self.selected_format = None;
                        self.enter(Screen::Confirmation);
                    }
                    Ok(catalog) => {
                        debug!(formats = catalog.video.len(), has_audio = catalog.has_audio, "catalog loaded");
                        let mut choices = vec![DEFAULT_RESOLUTION_CHOICE.to_string()];
                        choices.extend(catalog.video.iter().map(Format::label));
                        self.formats = catalog.video;
                        self.show_choices(Screen::ResolutionChoice, choices);
                    }
                    Err(message) => {
                        self.enter(Screen::Terminal(Outcome::Error(format!("Failed to fetch formats: {}", message))));
                    }
                }
                None
            }
            (Screen::ResolutionChoice, Event::Select) => {
                self.selected_format = match self.cursor {
                    0 => None,
                    n => self.formats.get(n - 1).cloned(),
                };
                self.enter(Screen::Confirmation);
                None
            }
            (Screen::Confirmation, Event::Accept) => {
                self.snapshot = ProgressSnapshot::default();
                self.enter(Screen::Downloading);
                Some(Command::StartDownload(self.selections()))
            }
            (Screen::Confirmation, Event::Decline) => {
                self.enter(Screen::Terminal(Outcome::Cancelled));
                None
            }
            (Screen::Downloading, Event::Progress(update)) => {
                self.apply_progress(update);
                None
            }
            (Screen::Downloading, Event::Completed(result)) => {
                let outcome = match result {
                    CompletionResult::Success => Outcome::Success,
                    CompletionResult::Failure { reason } => Outcome::Failed(reason),
                };
                self.enter(Screen::Terminal(outcome));
                None
            }
            (screen, event) => {
                debug!(?screen, ?event, "event ignored");
                None
            }
        }
    }

    pub fn selections(&self) -> Selections {
        Selections {
            url: self.url.clone(),
            title: self.title.clone(),
            playlist: self.playlist.clone(),
            audio_only: self.audio_only,
            format_id: self.selected_format.as_ref().map(|f| f.id.clone()),
            cookie_browser: self.cookie_browser.clone(),
        }
    }

    fn enter(&mut self, screen: Screen) {
        debug!(from = ?self.screen, to = ?screen, "screen transition");
        self.screen = screen;
        if !self.screen.has_choices() {
            self.choices.clear();
            self.cursor = 0;
        }
    }

    fn show_choices(&mut self, screen: Screen, choices: Vec<String>) {
        self.screen = screen;
        self.choices = choices;
        self.cursor = 0;
    }

    fn navigate(&mut self, event: &Event) {
        if !self.screen.has_choices() || self.choices.is_empty() {
            return;
        }
        let last = self.choices.len() - 1;
        self.cursor = match event {
            Event::Previous => self.cursor.saturating_sub(1),
            _ => (self.cursor + 1).min(last),
        };
    }

    fn fetch_metadata(&self) -> Command {
        Command::FetchMetadata {
            url: self.url.clone(),
            cookie_browser: self.cookie_browser.clone(),
        }
    }

    fn submit_url(&mut self) -> Option<Command> {
        let url = self.url_input.trim().to_string();
        if url.is_empty() {
            self.enter(Screen::Terminal(Outcome::Error("No URL provided".into())));
            return None;
        }
        self.url = url;
        self.enter(Screen::MetadataLoading);
        Some(self.fetch_metadata())
    }

    fn on_metadata(&mut self, result: Result<Metadata, MetadataError>) -> Option<Command> {
        match result {
            Ok(metadata) => {
                self.title = metadata.title;
                self.playlist = metadata.playlist;
                self.show_choices(
                    Screen::FormatChoice,
                    vec![VIDEO_CHOICE.to_string(), AUDIO_CHOICE.to_string()],
                );
                if self.prefer_audio {
                    self.cursor = 1;
                }
                None
            }
            Err(err) if err.is_auth_required() && self.cookie_browser.is_none() => {
                self.enter(Screen::BrowserDetection);
                Some(Command::DetectBrowsers)
            }
            Err(err) => {
                self.enter(Screen::Terminal(Outcome::Error(format!("Failed to fetch metadata: {}", err))));
                None
            }
        }
    }

    fn apply_progress(&mut self, update: ProgressUpdate) {
        let snap = &mut self.snapshot;
        if update.attempt < snap.attempt {
            return;
        }
        if update.attempt > snap.attempt {
            *snap = ProgressSnapshot {
                attempt: update.attempt,
                used_fallback: update.used_fallback,
                ..ProgressSnapshot::default()
            };
        }
        let event = update.event;
        snap.raw_line = event.line;
        if event.kind == EventKind::Progress {
            snap.percent = snap.percent.max(event.percent);
            snap.speed = event.speed.or(snap.speed.take());
            snap.eta = event.eta.or(snap.eta.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{ArgBuilder, ArgSpec};
    use crate::types::{MetadataErrorKind, ProgressEvent};
    use std::path::Path;

    fn video(id: &str, height: u32) -> Format {
        Format {
            id: id.into(),
            height,
            ext: "mp4".into(),
            is_audio: false,
            protocol: "https".into(),
            file_size: None,
        }
    }

    fn metadata(title: &str) -> Event {
        Event::MetadataLoaded(Ok(Metadata {
            title: title.into(),
            playlist: None,
        }))
    }

    fn auth_error() -> Event {
        Event::MetadataLoaded(Err(MetadataError {
            kind: MetadataErrorKind::AuthRequired,
            message: "ERROR: Sign in to confirm your age".into(),
        }))
    }

    fn progress(attempt: u32, kind: EventKind, percent: f64) -> Event {
        Event::Progress(ProgressUpdate {
            attempt,
            used_fallback: false,
            event: ProgressEvent {
                kind,
                line: format!("line {percent}"),
                percent,
                speed: Some("1MiB/s".into()),
                eta: None,
            },
        })
    }

    fn type_url(session: &mut Session, url: &str) {
        for c in url.chars() {
            assert_eq!(session.handle(Event::Char(c)), None);
        }
    }

    /// Drives a session into FormatChoice for `url`.
    fn at_format_choice(url: &str) -> Session {
        let mut s = Session::new(None);
        type_url(&mut s, url);
        s.handle(Event::Select);
        s.handle(metadata("Clip"));
        assert_eq!(s.screen(), &Screen::FormatChoice);
        s
    }

    #[test]
    fn empty_url_ends_without_a_query() {
        let mut s = Session::new(None);
        type_url(&mut s, "   ");
        assert_eq!(s.handle(Event::Select), None);
        assert_eq!(s.screen(), &Screen::Terminal(Outcome::Error("No URL provided".into())));
    }

    #[test]
    fn existing_file_ends_before_any_choice() {
        let (mut s, _) = Session::new(None).with_url("https://x/v");
        let path = PathBuf::from("/out/Clip.mp4");
        assert_eq!(s.handle(Event::AlreadyDownloaded(path.clone())), None);
        assert_eq!(s.screen(), &Screen::Terminal(Outcome::AlreadyDownloaded(path)));
        assert_eq!(s.handle(Event::Select), None);
    }

    #[test]
    fn submitting_a_url_fetches_metadata_once() {
        let mut s = Session::new(None);
        type_url(&mut s, "https://x/v");
        s.handle(Event::Backspace);
        s.handle(Event::Char('w'));
        let cmd = s.handle(Event::Select);
        assert_eq!(
            cmd,
            Some(Command::FetchMetadata {
                url: "https://x/w".into(),
                cookie_browser: None
            })
        );
        assert_eq!(s.screen(), &Screen::MetadataLoading);
        // no second query while one is pending
        assert_eq!(s.handle(Event::Select), None);
        assert_eq!(s.handle(Event::Char('x')), None);
        assert_eq!(s.screen(), &Screen::MetadataLoading);
    }

    #[test]
    fn auth_error_without_browser_leads_to_browser_selection() {
        let mut s = Session::new(None);
        type_url(&mut s, "u");
        s.handle(Event::Select);
        assert_eq!(s.handle(auth_error()), Some(Command::DetectBrowsers));
        assert_eq!(s.screen(), &Screen::BrowserDetection);

        s.handle(Event::BrowsersDetected(vec!["firefox".into(), "chrome".into()]));
        assert_eq!(s.screen(), &Screen::BrowserSelection);
        s.handle(Event::Next);
        let cmd = s.handle(Event::Select);
        assert_eq!(
            cmd,
            Some(Command::FetchMetadata {
                url: "u".into(),
                cookie_browser: Some("chrome".into())
            })
        );
        assert_eq!(s.screen(), &Screen::MetadataLoading);

        // a second sign-in failure with cookies bound is terminal
        s.handle(auth_error());
        assert!(matches!(s.screen(), Screen::Terminal(Outcome::Error(m)) if m.contains("Sign in")));
    }

    #[test]
    fn auth_error_with_preset_browser_is_terminal() {
        let (mut s, cmd) = Session::new(Some("firefox".into())).with_url("u");
        assert_eq!(
            cmd,
            Some(Command::FetchMetadata {
                url: "u".into(),
                cookie_browser: Some("firefox".into())
            })
        );
        s.handle(auth_error());
        assert!(s.screen().is_terminal());
    }

    #[test]
    fn no_browsers_found_is_terminal() {
        let mut s = Session::new(None);
        type_url(&mut s, "u");
        s.handle(Event::Select);
        s.handle(auth_error());
        s.handle(Event::BrowsersDetected(vec![]));
        assert!(matches!(s.screen(), Screen::Terminal(Outcome::Error(m)) if m.contains("No supported browsers")));
    }

    #[test]
    fn other_metadata_errors_are_terminal_with_tool_text() {
        let mut s = Session::new(None);
        type_url(&mut s, "u");
        s.handle(Event::Select);
        s.handle(Event::MetadataLoaded(Err(MetadataError {
            kind: MetadataErrorKind::Other,
            message: "ERROR: boom".into(),
        })));
        assert_eq!(
            s.screen(),
            &Screen::Terminal(Outcome::Error("Failed to fetch metadata: ERROR: boom".into()))
        );
    }

    #[test]
    fn navigation_clamps_and_never_changes_screen() {
        let mut s = at_format_choice("u");
        s.handle(Event::Previous);
        assert_eq!(s.view().cursor, 0);
        s.handle(Event::Next);
        s.handle(Event::Next);
        s.handle(Event::Next);
        assert_eq!(s.view().cursor, 1);
        assert_eq!(s.screen(), &Screen::FormatChoice);

        let mut loading = Session::new(None);
        type_url(&mut loading, "u");
        loading.handle(Event::Select);
        loading.handle(Event::Next);
        assert_eq!(loading.view().cursor, 0);
        assert_eq!(loading.screen(), &Screen::MetadataLoading);
    }

    #[test]
    fn audio_only_goes_straight_to_confirmation() {
        let mut s = at_format_choice("u");
        s.handle(Event::Next);
        assert_eq!(s.handle(Event::Select), None);
        assert_eq!(s.screen(), &Screen::Confirmation);
        match s.handle(Event::Accept) {
            Some(Command::StartDownload(sel)) => {
                assert!(sel.audio_only);
                assert_eq!(sel.format_id, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn audio_preference_moves_the_format_cursor() {
        let (mut s, _) = Session::new(None).prefer_audio(true).with_url("u");
        s.handle(metadata("Clip"));
        assert_eq!(s.view().cursor, 1);
        s.handle(Event::Select);
        assert!(s.selections().audio_only);
    }

    #[test]
    fn empty_catalog_skips_resolution_choice() {
        let mut s = at_format_choice("u");
        s.handle(Event::Select);
        s.handle(Event::FormatsLoaded(Ok(Catalog::default())));
        assert_eq!(s.screen(), &Screen::Confirmation);
    }

    #[test]
    fn catalog_error_is_terminal() {
        let mut s = at_format_choice("u");
        s.handle(Event::Select);
        s.handle(Event::FormatsLoaded(Err("ERROR: 403".into())));
        assert_eq!(
            s.screen(),
            &Screen::Terminal(Outcome::Error("Failed to fetch formats: ERROR: 403".into()))
        );
    }

    #[test]
    fn default_resolution_leaves_format_unset() {
        let mut s = at_format_choice("u");
        s.handle(Event::Select);
        s.handle(Event::FormatsLoaded(Ok(Catalog {
            video: vec![video("137", 1080)],
            has_audio: true,
        })));
        assert_eq!(s.view().choices[0], DEFAULT_RESOLUTION_CHOICE);
        s.handle(Event::Select);
        assert_eq!(s.selections().format_id, None);
    }

    #[test]
    fn decline_cancels() {
        let mut s = at_format_choice("u");
        s.handle(Event::Next);
        s.handle(Event::Select);
        s.handle(Event::Decline);
        assert_eq!(s.screen(), &Screen::Terminal(Outcome::Cancelled));
    }

    #[test]
    fn interrupt_cancels_from_every_screen() {
        let builders: Vec<fn() -> Session> = vec![
            || Session::new(None),
            || Session::new(None).with_url("u").0,
            || at_format_choice("u"),
            || {
                let mut s = at_format_choice("u");
                s.handle(Event::Select);
                s
            },
        ];
        for build in builders {
            let mut s = build();
            assert_eq!(s.handle(Event::Interrupt), None);
            assert_eq!(s.screen(), &Screen::Terminal(Outcome::Cancelled));
            // terminal screens swallow everything afterwards
            assert_eq!(s.handle(Event::Select), None);
            assert_eq!(s.screen(), &Screen::Terminal(Outcome::Cancelled));
        }
    }

    #[test]
    fn stray_results_are_ignored() {
        let mut s = at_format_choice("u");
        assert_eq!(s.handle(Event::Completed(CompletionResult::Success)), None);
        assert_eq!(s.handle(Event::BrowsersDetected(vec!["firefox".into()])), None);
        assert_eq!(s.handle(progress(1, EventKind::Progress, 50.0)), None);
        assert_eq!(s.screen(), &Screen::FormatChoice);
        assert_eq!(s.view().snapshot.percent, 0.0);
    }

    #[test]
    fn progress_is_monotonic_within_an_attempt_and_resets_on_retry() {
        let mut s = at_format_choice("u");
        s.handle(Event::Next);
        s.handle(Event::Select);
        s.handle(Event::Accept);
        assert_eq!(s.screen(), &Screen::Downloading);

        s.handle(progress(1, EventKind::Progress, 40.0));
        s.handle(progress(1, EventKind::Progress, 30.0));
        assert_eq!(s.view().snapshot.percent, 40.0);
        s.handle(progress(1, EventKind::Info, 0.0));
        assert_eq!(s.view().snapshot.percent, 40.0);
        assert_eq!(s.view().snapshot.raw_line, "line 0");

        s.handle(progress(2, EventKind::Progress, 5.0));
        assert_eq!(s.view().snapshot.percent, 5.0);
        assert_eq!(s.view().snapshot.attempt, 2);
        s.handle(progress(1, EventKind::Progress, 90.0));
        assert_eq!(s.view().snapshot.percent, 5.0);
        assert_eq!(s.screen(), &Screen::Downloading);
    }

    #[test]
    fn failed_download_is_terminal_failure() {
        let mut s = at_format_choice("u");
        s.handle(Event::Next);
        s.handle(Event::Select);
        s.handle(Event::Accept);
        s.handle(Event::Completed(CompletionResult::Failure {
            reason: "all 3 download attempts failed, including fallback".into(),
        }));
        assert!(matches!(s.screen(), Screen::Terminal(Outcome::Failed(r)) if r.contains("fallback")));
    }

    #[test]
    fn scripted_walk_selecting_720p_downloads_that_format() {
        let mut s = Session::new(None);
        let mut screens = vec![s.screen().clone()];
        let mut record = |s: &Session| screens.push(s.screen().clone());

        type_url(&mut s, "https://example.com/watch?v=1");
        let cmd = s.handle(Event::Select);
        assert!(matches!(cmd, Some(Command::FetchMetadata { .. })));
        record(&s);

        assert_eq!(s.handle(metadata("Clip")), None);
        record(&s);

        let cmd = s.handle(Event::Select);
        assert!(matches!(cmd, Some(Command::FetchFormats { .. })));
        record(&s);

        s.handle(Event::FormatsLoaded(Ok(Catalog {
            video: vec![video("137", 1080), video("136", 720), video("135", 480)],
            has_audio: true,
        })));
        record(&s);
        assert_eq!(s.view().choices.len(), 4);

        s.handle(Event::Next);
        s.handle(Event::Next);
        assert!(s.view().choices[s.view().cursor].starts_with("720p"));
        s.handle(Event::Select);
        record(&s);

        let selections = match s.handle(Event::Accept) {
            Some(Command::StartDownload(sel)) => sel,
            other => panic!("unexpected {:?}", other),
        };
        record(&s);
        assert_eq!(selections.format_id.as_deref(), Some("136"));
        assert!(!selections.audio_only);
        let builder = ArgBuilder {
            output_template: "%(title)s.%(ext)s".into(),
            audio_format: "mp3".into(),
            accelerator: None,
        };
        let args = builder.build(&ArgSpec::primary(&selections, false), Path::new("w"), &selections.url);
        let format = args.iter().position(|a| a == "--format").map(|i| args[i + 1].as_str());
        assert_eq!(format, Some("136+bestaudio/best"));

        s.handle(progress(1, EventKind::Progress, 45.2));
        s.handle(Event::Completed(CompletionResult::Success));
        record(&s);

        assert_eq!(
            screens,
            vec![
                Screen::UrlInput,
                Screen::MetadataLoading,
                Screen::FormatChoice,
                Screen::FormatsLoading,
                Screen::ResolutionChoice,
                Screen::Confirmation,
                Screen::Downloading,
                Screen::Terminal(Outcome::Success),
            ]
        );
    }
}
