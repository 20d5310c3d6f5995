//! TUI - session sidebar, conversation, composer
//!
//! Features:
//! - Session list with create/open/delete
//! - Active conversation with "thinking" placeholders
//! - API status and recent-event log

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Tabs, Wrap},
};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use unicode_width::UnicodeWidthStr;

use crate::app::{ApiStatus, App, AppEvent};
use crate::message::{Message, Sender};

const SIDEBAR_WIDTH: u16 = 30;

// ═══════════════════════════════════════════════════════════════
// MAIN TUI
// ═══════════════════════════════════════════════════════════════

/// Tab selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tab {
    Chat,
    Log,
}

impl Tab {
    fn all() -> &'static [Tab] {
        &[Tab::Chat, Tab::Log]
    }

    fn name(&self) -> &'static str {
        match self {
            Tab::Chat => "Chat",
            Tab::Log => "Log",
        }
    }
}

/// View-only state; everything else lives in `AppState`
struct TuiState {
    tab: Tab,
    input: String,
    /// Sidebar cursor
    cursor: usize,
    notice: Option<String>,
    tick: usize,
}

impl TuiState {
    fn new() -> Self {
        Self {
            tab: Tab::Chat,
            input: String::new(),
            cursor: 0,
            notice: None,
            tick: 0,
        }
    }
}

/// Run the main TUI
pub async fn run_tui(
    app: &mut App,
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    api_url: &str,
) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let result = run_tui_loop(&mut terminal, app, events, api_url).await;
    restore_terminal(terminal)?;
    result
}

async fn run_tui_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    api_url: &str,
) -> Result<()> {
    let mut state = TuiState::new();

    // Show "Checking" while the health check runs
    terminal.draw(|f| render_tui(f, &state, app, api_url))?;
    app.initialize().await;

    loop {
        state.tick += 1;

        // Apply finished network work
        while let Ok(event) = events.try_recv() {
            app.handle(event);
        }

        let session_count = app.state().sessions.len();
        if state.cursor >= session_count {
            state.cursor = session_count.saturating_sub(1);
        }

        terminal.draw(|f| render_tui(f, &state, app, api_url))?;

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc => break,
            KeyCode::Char('c') if ctrl => break,
            KeyCode::Tab => {
                let tabs = Tab::all();
                let idx = tabs.iter().position(|t| *t == state.tab).unwrap_or(0);
                state.tab = tabs[(idx + 1) % tabs.len()];
            }
            KeyCode::Char('n') if ctrl => {
                let id = app.new_session();
                state.cursor = 0;
                state.notice = Some(format!("New session {}", id));
            }
            KeyCode::Char('o') if ctrl => {
                if let Some(id) = app.state().sessions.get(state.cursor).cloned() {
                    app.select_session(&id);
                    state.notice = None;
                }
            }
            KeyCode::Char('d') if ctrl => {
                if let Some(id) = app.state().sessions.get(state.cursor).cloned() {
                    app.delete_session(&id);
                    state.notice = Some(format!("Deleted {}", id));
                }
            }
            KeyCode::Char('r') if ctrl => {
                app.recheck_health();
                state.notice = Some("Checking API...".into());
            }
            KeyCode::Up => {
                state.cursor = state.cursor.saturating_sub(1);
            }
            KeyCode::Down => {
                if state.cursor + 1 < app.state().sessions.len() {
                    state.cursor += 1;
                }
            }
            KeyCode::Enter if state.tab == Tab::Chat => match app.send(&state.input) {
                Ok(_) => {
                    state.input.clear();
                    state.notice = None;
                }
                Err(e) => state.notice = Some(format!("⚠ {}", e)),
            },
            KeyCode::Char(c) if state.tab == Tab::Chat && !ctrl => {
                state.input.push(c);
            }
            KeyCode::Backspace if state.tab == Tab::Chat => {
                state.input.pop();
            }
            _ => {}
        }
    }

    Ok(())
}

fn render_tui(f: &mut Frame, state: &TuiState, app: &App, api_url: &str) {
    let area = f.size();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header + tabs
            Constraint::Min(5),    // Main content
            Constraint::Length(3), // Input
            Constraint::Length(1), // Status
        ])
        .split(area);

    let api_status = app.state().api_status;
    let tabs = Tabs::new(Tab::all().iter().map(|t| t.name()))
        .select(Tab::all().iter().position(|t| *t == state.tab).unwrap_or(0))
        .style(Style::default().fg(Color::White))
        .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("chatline | {} | API: {}", api_url, api_status.name())),
        );
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        Tab::Chat => {
            let columns = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(20)])
                .split(chunks[1]);
            render_sessions(f, state, app, columns[0]);
            render_chat(f, state, app, columns[1]);
        }
        Tab::Log => render_log(f, app, chunks[1]),
    }

    // Input
    let active = app.state().active.as_deref();
    let busy = active.map(|id| app.state().is_loading(id)).unwrap_or(false);
    let input_style = if busy || active.is_none() {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default()
    };
    let input_title = if active.is_none() {
        "No session selected (Ctrl-N for a new one)".to_string()
    } else if busy {
        "Waiting for reply...".to_string()
    } else {
        "Type a message (Enter to send)".to_string()
    };
    let input = Paragraph::new(state.input.as_str())
        .style(input_style)
        .block(Block::default().borders(Borders::ALL).title(input_title));
    f.render_widget(input, chunks[2]);

    // Status bar
    let user = app
        .state()
        .user_id
        .as_deref()
        .map(|id| format!("User: {}...", id.chars().take(8).collect::<String>()))
        .unwrap_or_default();
    let status = match &state.notice {
        Some(notice) => format!(" {} | {}", notice, user),
        None => format!(
            " {} | ^N new ^O open ^D delete ^R recheck Tab:log Esc:quit",
            user
        ),
    };
    let status_style = match api_status {
        ApiStatus::Disconnected => Style::default().fg(Color::Red),
        ApiStatus::Checking => Style::default().fg(Color::Yellow),
        ApiStatus::Connected => Style::default().fg(Color::DarkGray),
    };
    f.render_widget(Paragraph::new(status).style(status_style), chunks[3]);
}

fn render_sessions(f: &mut Frame, state: &TuiState, app: &App, area: Rect) {
    let width = area.width.saturating_sub(4) as usize;
    let app_state = app.state();

    let items: Vec<ListItem> = app_state
        .sessions
        .iter()
        .map(|id| {
            let marker = if app_state.active.as_ref() == Some(id) { "●" } else { " " };
            let syncing = if app_state.activation_phase(id).is_some() { "↻" } else { "" };
            let label = fit(&format!("{} {}{}", marker, id, syncing), width);
            ListItem::new(label)
        })
        .collect();

    let mut list_state = ListState::default();
    if !app_state.sessions.is_empty() {
        list_state.select(Some(state.cursor));
    }

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("Sessions"))
        .highlight_style(Style::default().fg(Color::Black).bg(Color::Cyan));
    f.render_stateful_widget(list, area, &mut list_state);
}

fn render_chat(f: &mut Frame, state: &TuiState, app: &App, area: Rect) {
    let app_state = app.state();
    let title = match app_state.active.as_deref() {
        Some(id) => {
            let mut t = format!("Session: {}", id);
            if let Some(phase) = app_state.activation_phase(id) {
                t.push_str(&format!(" ({})", phase.name()));
            }
            if app_state.is_loading(id) {
                t.push_str(" | Thinking…");
            }
            t
        }
        None => "No session selected".to_string(),
    };

    let messages = app_state.active_conversation();
    let lines: Vec<Line> = if app_state.active.is_none() {
        vec![]
    } else if messages.is_empty() {
        vec![Line::styled(
            "Start the conversation — say hi",
            Style::default().fg(Color::DarkGray),
        )]
    } else {
        messages
            .iter()
            .flat_map(|m| message_lines(m, state.tick))
            .collect()
    };

    // Keep the newest messages in view
    let inner_width = area.width.saturating_sub(2).max(1) as usize;
    let inner_height = area.height.saturating_sub(2) as usize;
    let rows: usize = lines
        .iter()
        .map(|l| wrapped_rows(l.width(), inner_width))
        .sum();
    let scroll = rows.saturating_sub(inner_height) as u16;

    let para = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((scroll, 0))
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(para, area);
}

fn message_lines(message: &Message, tick: usize) -> Vec<Line<'static>> {
    match message {
        Message::Pending { .. } => vec![
            Line::styled(
                format!("  {} thinking…", spinner_char(tick)),
                Style::default().fg(Color::DarkGray),
            ),
            Line::default(),
        ],
        Message::Real { sender, text } => {
            let (prefix, style) = match sender {
                Sender::User => ("> ", Style::default().fg(Color::Cyan)),
                Sender::Bot => ("  ", Style::default()),
            };
            let mut lines: Vec<Line> = text
                .lines()
                .map(|l| Line::styled(format!("{}{}", prefix, l), style))
                .collect();
            lines.push(Line::default());
            lines
        }
    }
}

fn render_log(f: &mut Frame, app: &App, area: Rect) {
    let text: String = app
        .state()
        .log
        .iter()
        .rev()
        .take(50)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    let para = Paragraph::new(text).block(Block::default().borders(Borders::ALL).title("Log"));
    f.render_widget(para, area);
}

fn spinner_char(tick: usize) -> char {
    const SPINNER: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
    SPINNER[tick % SPINNER.len()]
}

/// Rows a line of `width` columns takes when wrapped to `inner`
fn wrapped_rows(width: usize, inner: usize) -> usize {
    if width == 0 {
        1
    } else {
        width.div_ceil(inner)
    }
}

/// Truncate to `width` display columns, marking the cut
fn fit(s: &str, width: usize) -> String {
    if s.width() <= width {
        return s.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for c in s.chars() {
        let w = unicode_width::UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        out.push(c);
        used += w;
    }
    out.push('…');
    out
}

// ═══════════════════════════════════════════════════════════════
// TERMINAL SETUP
// ═══════════════════════════════════════════════════════════════

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
