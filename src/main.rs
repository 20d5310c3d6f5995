//! chatline - terminal chat client
//!
//! USAGE:
//!   chatline [--url <base>]           # interactive chat
//!   chatline doctor [--url <base>]    # check config, store, backend
//!   chatline sessions                 # list local sessions
//!   chatline config set url <value>   # non-interactive config

use anyhow::Result;
use std::sync::Arc;

use chatline::app::App;
use chatline::client::BackendClient;
use chatline::config;
use chatline::logging;
use chatline::store::LocalStore;
use chatline::ui;

// ═══════════════════════════════════════════════════════════════
// CLI
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Interactive { url: Option<String> },
    Doctor { url: Option<String> },
    Sessions,
    ConfigSet { key: String, value: String },
    Help,
}

fn parse_args(args: &[String]) -> Command {
    if args.iter().any(|a| a == "--help" || a == "-h") {
        return Command::Help;
    }

    let url = args
        .iter()
        .position(|a| a == "--url" || a == "-u")
        .and_then(|i| args.get(i + 1))
        .cloned();

    match args.first().map(|s| s.as_str()) {
        Some("doctor") => Command::Doctor { url },
        Some("sessions") => Command::Sessions,
        Some("config") if args.get(1).map(|s| s.as_str()) == Some("set") => Command::ConfigSet {
            key: args.get(2).cloned().unwrap_or_default(),
            value: args.get(3).cloned().unwrap_or_default(),
        },
        _ => Command::Interactive { url },
    }
}

fn print_help() {
    println!(
        r#"chatline - terminal chat client

USAGE:
    chatline [--url <base>]           # interactive chat
    chatline doctor [--url <base>]    # check config, store, backend
    chatline sessions                 # list local sessions
    chatline config set url <value>   # set backend URL

FLAGS:
    -u, --url <base>        Backend base URL for this run
    -h, --help              Show this help

CONFIG:
    ~/.config/chatline/config.json    Backend URL, store location
    ~/.local/state/chatline/store/    Sessions and conversations
    ~/.local/state/chatline/chatline.log

ENVIRONMENT:
    CHATLINE_API_URL        Override backend URL from config
    CHATLINE_LOG            Log filter (e.g. debug, chatline=trace)

CONTROLS (interactive mode):
    Enter   Send message
    Up/Down Move session cursor
    Ctrl-O  Open session under cursor
    Ctrl-N  New session
    Ctrl-D  Delete session under cursor
    Ctrl-R  Re-check API
    Tab     Switch tabs
    Esc     Quit
"#
    );
}

// ═══════════════════════════════════════════════════════════════
// MAIN
// ═══════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args) {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Doctor { url } => run_doctor(url.as_deref()).await,
        Command::Sessions => run_sessions(),
        Command::ConfigSet { key, value } => run_config_set(&key, &value),
        Command::Interactive { url } => run_interactive(url.as_deref()).await,
    }
}

// ═══════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════

async fn run_doctor(url: Option<&str>) -> Result<()> {
    println!("chatline doctor\n");

    let cfg = config::Config::load()?;
    let config_path = config::config_path()?;
    println!(
        "[{}] Config: {}",
        if config_path.exists() { "✓" } else { "-" },
        config_path.display()
    );

    let store = LocalStore::open(cfg.store_dir()?)?;
    let local = store.load();
    println!(
        "[✓] Store: {} ({} sessions)",
        store.dir().display(),
        local.sessions.len()
    );
    println!(
        "[{}] User id: {}",
        if local.user_id.is_some() { "✓" } else { "-" },
        local.user_id.as_deref().unwrap_or("not created yet")
    );

    let api_url = cfg.api_url(url);
    let client = BackendClient::new(api_url.clone());
    print!("[?] API {}: checking...", api_url);
    match client.health().await {
        Ok(report) => println!(
            "\r[✓] API {}: connected (db: {})         ",
            api_url,
            report.db_status.as_deref().unwrap_or("unknown")
        ),
        Err(e) => println!("\r[✗] API {}: {}", api_url, e),
    }

    Ok(())
}

fn run_sessions() -> Result<()> {
    let cfg = config::Config::load()?;
    let store = LocalStore::open(cfg.store_dir()?)?;
    let local = store.load();

    if local.sessions.is_empty() {
        println!("No local sessions");
        return Ok(());
    }

    for id in &local.sessions {
        let count = local.conversations.get(id).map(Vec::len).unwrap_or(0);
        println!("  {} ({} messages)", id, count);
    }
    Ok(())
}

fn run_config_set(key: &str, value: &str) -> Result<()> {
    let mut cfg = config::Config::load()?;

    match key {
        "url" | "api_url" => {
            cfg.api_url = Some(value.trim_end_matches('/').to_string());
            cfg.save()?;
            println!("Backend URL set to: {}", value);
        }
        "store" | "store_dir" => {
            cfg.store_dir = Some(value.into());
            cfg.save()?;
            println!("Store directory set to: {}", value);
        }
        _ => {
            anyhow::bail!("Unknown config key: {}. Valid keys: url, store", key);
        }
    }
    Ok(())
}

async fn run_interactive(url: Option<&str>) -> Result<()> {
    let cfg = config::Config::load()?;
    let state_dir = config::state_dir()?;
    let _guard = logging::init(&state_dir)?;

    let api_url = cfg.api_url(url);
    tracing::info!(%api_url, "starting chatline");

    let store = LocalStore::open(cfg.store_dir()?)?;
    let backend = Arc::new(BackendClient::new(api_url.clone()));
    let (mut app, mut events) = App::new(store, backend);

    let result = ui::run_tui(&mut app, &mut events, &api_url).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "tui exited with error");
        eprintln!("Log: {}", logging::log_path(&state_dir).display());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_default_interactive() {
        assert_eq!(parse_args(&[]), Command::Interactive { url: None });
        assert_eq!(
            parse_args(&args(&["--url", "http://h:1"])),
            Command::Interactive {
                url: Some("http://h:1".into())
            }
        );
    }

    #[test]
    fn test_parse_subcommands() {
        assert_eq!(parse_args(&args(&["sessions"])), Command::Sessions);
        assert_eq!(parse_args(&args(&["doctor"])), Command::Doctor { url: None });
        assert_eq!(
            parse_args(&args(&["config", "set", "url", "http://x"])),
            Command::ConfigSet {
                key: "url".into(),
                value: "http://x".into()
            }
        );
        assert_eq!(parse_args(&args(&["doctor", "-h"])), Command::Help);
    }
}
