use anyhow::Result;
use crossterm::{
    event::{self, Event as TermEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::time::Duration;
use unicode_width::UnicodeWidthChar;

use crate::app::App;
use crate::session::{Event, Outcome, Screen, View};

const TICK: Duration = Duration::from_millis(100);

/// Maps a key press to a session event. Text entry only happens on the URL screen.
pub fn key_to_event(key: KeyEvent, screen: &Screen) -> Option<Event> {
    if key.modifiers.contains(KeyModifiers::CONTROL) && matches!(key.code, KeyCode::Char('c') | KeyCode::Char('C')) {
        return Some(Event::Interrupt);
    }
    if key.code == KeyCode::Esc {
        return Some(Event::Interrupt);
    }
    if *screen == Screen::UrlInput {
        return match key.code {
            KeyCode::Enter => Some(Event::Select),
            KeyCode::Backspace => Some(Event::Backspace),
            KeyCode::Char(c) => Some(Event::Char(c)),
            _ => None,
        };
    }
    match key.code {
        KeyCode::Up | KeyCode::Char('k') => Some(Event::Previous),
        KeyCode::Down | KeyCode::Char('j') => Some(Event::Next),
        KeyCode::Enter => Some(Event::Select),
        KeyCode::Char('y') | KeyCode::Char('Y') => Some(Event::Accept),
        KeyCode::Char('n') | KeyCode::Char('N') => Some(Event::Decline),
        KeyCode::Char('q') | KeyCode::Char('Q') => Some(Event::Interrupt),
        _ => None,
    }
}

/// Cuts `text` to `width` terminal columns.
pub fn fit_width(text: &str, width: usize) -> String {
    let mut used = 0;
    let mut out = String::new();
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > width {
            break;
        }
        used += w;
        out.push(c);
    }
    out
}

fn loading(label: &str, tick: u64) -> String {
    format!("{}{}", label, ".".repeat((tick % 4) as usize))
}

fn key_hints(screen: &Screen) -> Vec<(&'static str, &'static str)> {
    match screen {
        Screen::UrlInput => vec![("Enter", "Submit"), ("Esc", "Quit")],
        Screen::BrowserSelection | Screen::FormatChoice | Screen::ResolutionChoice => {
            vec![("↑/k ↓/j", "Move"), ("Enter", "Select"), ("q", "Quit")]
        }
        Screen::Confirmation => vec![("y", "Download"), ("n", "Cancel"), ("q", "Quit")],
        Screen::Terminal(_) => vec![("Enter/q", "Exit")],
        _ => vec![("q/Ctrl+C", "Cancel")],
    }
}

fn draw_keybindings(f: &mut Frame, area: Rect, screen: &Screen) {
    let keybindings = key_hints(screen);
    let spans: Vec<Span> = keybindings
        .iter()
        .enumerate()
        .flat_map(|(idx, (key, desc))| {
            let mut v = vec![
                Span::styled(*key, Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
                Span::raw(": "),
                Span::raw(*desc),
            ];
            if idx < keybindings.len() - 1 {
                v.push(Span::raw("  │  "));
            }
            v
        })
        .collect();

    let para = Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL).title("Keybindings"));
    f.render_widget(para, area);
}

fn draw_choices(f: &mut Frame, area: Rect, title: &str, view: &View) {
    let items: Vec<ListItem> = view.choices.iter().map(|c| ListItem::new(c.as_str())).collect();
    let mut state = ListState::default();
    state.select(Some(view.cursor));
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title.to_string()))
        .highlight_style(Style::default().add_modifier(Modifier::BOLD).bg(Color::DarkGray))
        .highlight_symbol(">> ");
    f.render_stateful_widget(list, area, &mut state);
}

fn draw_message(f: &mut Frame, area: Rect, title: &str, lines: Vec<Line>) {
    let para = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title(title.to_string()));
    f.render_widget(para, area);
}

fn summary_lines<'a>(view: &View<'a>) -> Vec<Line<'a>> {
    let label = Style::default().fg(Color::Cyan);
    let mut lines = vec![Line::from(vec![Span::styled("Title:    ", label), Span::raw(view.title)])];
    if let Some(playlist) = view.playlist {
        lines.push(Line::from(vec![
            Span::styled("Playlist: ", label),
            Span::raw(format!("{} ({} videos)", playlist.title, playlist.count)),
        ]));
    }
    let format = if view.audio_only {
        "Audio only".to_string()
    } else {
        view.format_label.clone().unwrap_or_else(|| "Best available".to_string())
    };
    lines.push(Line::from(vec![Span::styled("Format:   ", label), Span::raw(format)]));
    if let Some(browser) = view.cookie_browser {
        lines.push(Line::from(vec![Span::styled("Cookies:  ", label), Span::raw(browser)]));
    }
    lines
}

fn draw_download(f: &mut Frame, area: Rect, view: &View) {
    let snap = view.snapshot;
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let title = if snap.used_fallback {
        format!("Downloading (attempt {}, fallback format)", snap.attempt)
    } else {
        format!("Downloading (attempt {})", snap.attempt.max(1))
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(if snap.used_fallback { Color::Yellow } else { Color::Cyan }))
        .ratio((snap.percent / 100.0).clamp(0.0, 1.0))
        .label(format!("{:.1}%", snap.percent));
    f.render_widget(gauge, chunks[0]);

    let stats = Line::from(vec![
        Span::styled("Speed: ", Style::default().fg(Color::Cyan)),
        Span::raw(snap.speed.clone().unwrap_or_else(|| "-".into())),
        Span::raw("   "),
        Span::styled("ETA: ", Style::default().fg(Color::Cyan)),
        Span::raw(snap.eta.clone().unwrap_or_else(|| "-".into())),
    ]);
    f.render_widget(Paragraph::new(stats).block(Block::default().borders(Borders::ALL)), chunks[1]);

    let width = chunks[2].width.saturating_sub(2) as usize;
    let raw = Line::from(Span::styled(fit_width(&snap.raw_line, width), Style::default().fg(Color::Gray)));
    let mut lines = summary_lines(view);
    lines.push(Line::raw(""));
    lines.push(raw);
    draw_message(f, chunks[2], view.url, lines);
}

fn draw_outcome(f: &mut Frame, area: Rect, view: &View, outcome: &Outcome) {
    let (title, color, text) = match outcome {
        Outcome::Success => ("Done", Color::Green, "✓ Download complete".to_string()),
        Outcome::Failed(reason) => ("Failed", Color::Red, format!("✗ {}", reason)),
        Outcome::Cancelled => ("Cancelled", Color::Yellow, "Cancelled".to_string()),
        Outcome::Error(message) => ("Error", Color::Red, format!("✗ {}", message)),
        Outcome::AlreadyDownloaded(path) => (
            "Done",
            Color::Green,
            format!("✓ Already downloaded: {}", path.display()),
        ),
    };
    let mut lines = vec![Line::from(Span::styled(text, Style::default().fg(color).add_modifier(Modifier::BOLD)))];
    if !view.title.is_empty() {
        lines.push(Line::raw(""));
        lines.extend(summary_lines(view));
    }
    draw_message(f, area, title, lines);
}

pub fn draw(f: &mut Frame, view: &View, tick: u64) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(f.area());
    let body = chunks[0];

    match view.screen {
        Screen::UrlInput => {
            let input = Line::from(vec![
                Span::raw(view.url_input),
                Span::styled("█", Style::default().fg(Color::Cyan)),
            ]);
            draw_message(f, body, "Enter a video or playlist URL", vec![input]);
        }
        Screen::MetadataLoading => {
            let mut lines = vec![Line::raw(loading("Fetching video information", tick))];
            if let Some(browser) = view.cookie_browser {
                lines.push(Line::raw(format!("Using cookies from {}", browser)));
            }
            draw_message(f, body, view.url, lines);
        }
        Screen::BrowserDetection => {
            let lines = vec![
                Line::raw("This video requires signing in."),
                Line::raw(loading("Looking for installed browsers", tick)),
            ];
            draw_message(f, body, view.url, lines);
        }
        Screen::BrowserSelection => draw_choices(f, body, "Read cookies from which browser?", view),
        Screen::FormatChoice => draw_choices(f, body, view.title, view),
        Screen::FormatsLoading => {
            draw_message(f, body, view.title, vec![Line::raw(loading("Fetching available formats", tick))]);
        }
        Screen::ResolutionChoice => draw_choices(f, body, "Resolution", view),
        Screen::Confirmation => {
            let mut lines = summary_lines(view);
            lines.push(Line::raw(""));
            lines.push(Line::from(Span::styled(
                "Start download? (y/n)",
                Style::default().add_modifier(Modifier::BOLD),
            )));
            draw_message(f, body, "Confirm", lines);
        }
        Screen::Downloading => draw_download(f, body, view),
        Screen::Terminal(outcome) => draw_outcome(f, body, view, outcome),
    }

    draw_keybindings(f, chunks[1], view.screen);
}

/// Drives the app until the user leaves a terminal screen.
pub fn run_tui(app: &mut App) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn event_loop(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> Result<()> {
    let mut tick: u64 = 0;
    loop {
        app.tick();
        terminal.draw(|f| draw(f, &app.view(), tick))?;
        tick = tick.wrapping_add(1);

        if !event::poll(TICK)? {
            continue;
        }
        let TermEvent::Key(key) = event::read()? else {
            continue;
        };
        if key.kind == KeyEventKind::Press && on_key(app, key) {
            return Ok(());
        }
    }
}

/// Applies one key press. Returns true when the UI should close: right away on
/// an interrupt, or on a dismiss key once an outcome is on screen.
fn on_key(app: &mut App, key: KeyEvent) -> bool {
    if app.is_finished() {
        let ctrl_c = key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c');
        return ctrl_c || matches!(key.code, KeyCode::Enter | KeyCode::Esc | KeyCode::Char('q'));
    }
    match key_to_event(key, app.screen()) {
        Some(Event::Interrupt) => {
            app.handle_event(Event::Interrupt);
            true
        }
        Some(event) => {
            app.handle_event(event);
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::types::{EventKind, Metadata, ProgressEvent, ProgressUpdate};
    use ratatui::backend::TestBackend;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn idle_app() -> App {
        use crate::app::Services;
        use crate::downloader::{ArgBuilder, Engine, RetryPolicy};
        use std::path::PathBuf;
        use std::sync::Arc;

        let services = Services {
            ytdlp: PathBuf::from("yt-dlp"),
            engine: Arc::new(Engine {
                program: PathBuf::from("yt-dlp"),
                builder: ArgBuilder {
                    output_template: "%(title)s.%(ext)s".into(),
                    audio_format: "mp3".into(),
                    accelerator: None,
                },
                policy: RetryPolicy {
                    max_retries: 1,
                    backoff: Duration::ZERO,
                },
            }),
            output_dir: std::env::temp_dir(),
        };
        App::new(Session::new(None), None, tokio::runtime::Handle::current(), services)
    }

    #[tokio::test]
    async fn interrupt_closes_the_ui_at_once() {
        let mut app = idle_app();
        assert!(!on_key(&mut app, press(KeyCode::Char('h'))));
        assert!(on_key(&mut app, KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)));
        assert_eq!(app.screen(), &Screen::Terminal(Outcome::Cancelled));
    }

    #[tokio::test]
    async fn outcomes_wait_for_a_dismiss_key() {
        let mut app = idle_app();
        // an empty URL ends on the error screen
        assert!(!on_key(&mut app, press(KeyCode::Enter)));
        assert!(matches!(app.screen(), Screen::Terminal(Outcome::Error(_))));
        assert!(!on_key(&mut app, press(KeyCode::Char('x'))));
        assert!(on_key(&mut app, press(KeyCode::Enter)));
    }

    #[test]
    fn letters_are_text_on_the_url_screen() {
        let screen = Screen::UrlInput;
        assert!(matches!(key_to_event(press(KeyCode::Char('q')), &screen), Some(Event::Char('q'))));
        assert!(matches!(key_to_event(press(KeyCode::Char('j')), &screen), Some(Event::Char('j'))));
        assert!(matches!(key_to_event(press(KeyCode::Enter), &screen), Some(Event::Select)));
        assert!(matches!(key_to_event(press(KeyCode::Esc), &screen), Some(Event::Interrupt)));
    }

    #[test]
    fn letters_are_commands_elsewhere() {
        let screen = Screen::Confirmation;
        assert!(matches!(key_to_event(press(KeyCode::Char('y')), &screen), Some(Event::Accept)));
        assert!(matches!(key_to_event(press(KeyCode::Char('n')), &screen), Some(Event::Decline)));
        assert!(matches!(key_to_event(press(KeyCode::Char('q')), &screen), Some(Event::Interrupt)));
        assert!(matches!(key_to_event(press(KeyCode::Char('k')), &Screen::FormatChoice), Some(Event::Previous)));
        assert!(matches!(key_to_event(press(KeyCode::Down), &Screen::FormatChoice), Some(Event::Next)));
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert!(matches!(key_to_event(ctrl_c, &Screen::Downloading), Some(Event::Interrupt)));
        assert!(key_to_event(press(KeyCode::Char('x')), &Screen::Downloading).is_none());
    }

    #[test]
    fn fit_width_counts_columns() {
        assert_eq!(fit_width("abcdef", 4), "abcd");
        assert_eq!(fit_width("日本語", 5), "日本");
        assert_eq!(fit_width("ok", 10), "ok");
    }

    fn rendered(session: &Session) -> String {
        let mut terminal = Terminal::new(TestBackend::new(80, 20)).unwrap();
        terminal.draw(|f| draw(f, &session.view(), 0)).unwrap();
        terminal.backend().buffer().content.iter().map(|c| c.symbol()).collect()
    }

    #[test]
    fn renders_choices_and_progress() {
        let (mut session, _) = Session::new(None).with_url("https://example.com/v");
        session.handle(Event::MetadataLoaded(Ok(Metadata {
            title: "My Clip".into(),
            playlist: None,
        })));
        let screen = rendered(&session);
        assert!(screen.contains("Video (with audio)"));
        assert!(screen.contains("Audio only"));

        session.handle(Event::Next);
        session.handle(Event::Select);
        session.handle(Event::Accept);
        session.handle(Event::Progress(ProgressUpdate {
            attempt: 1,
            used_fallback: false,
            event: ProgressEvent {
                kind: EventKind::Progress,
                line: "[download]  42.0% of 10.00MiB".into(),
                percent: 42.0,
                speed: Some("2.00MiB/s".into()),
                eta: Some("00:03".into()),
            },
        }));
        let screen = rendered(&session);
        assert!(screen.contains("42.0%"));
        assert!(screen.contains("2.00MiB/s"));
        assert!(screen.contains("00:03"));
    }
}
