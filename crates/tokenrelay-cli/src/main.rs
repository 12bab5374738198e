//! tokenrelay - keep an API session alive from the command line.
//!
//! Stores an access/refresh token pair, refreshes it on demand or on a
//! schedule, and sends authenticated requests that recover from expired
//! access tokens on their own.

mod terminal;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenrelay_core::auth::{Session, SessionExpiryState, TokenPair};
use tokenrelay_core::{ApiError, ApiRequest, Config};

use terminal::{TerminalNavigator, TerminalNotices};

const USAGE: &str = "\
Usage: tokenrelay <command>

Commands:
  init <url>    Save the API base URL to the config file
  status        Show whether a session is stored
  import        Store an access/refresh token pair (prompted, or from
                TOKENRELAY_ACCESS_TOKEN / TOKENRELAY_REFRESH_TOKEN)
  refresh       Exchange the refresh token for a new pair now
  get <path>    Send an authenticated GET and print the response
  logout        Remove stored credentials
  watch         Keep the session fresh until interrupted";

/// Log file name prefix for `watch` mode
const LOG_FILE_PREFIX: &str = "tokenrelay.log";

/// Initialize the tracing subscriber for logging.
/// With a log directory, events are also written to a daily rolling file.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    config.apply_env();
    Ok(config)
}

fn open_session(config: &Config) -> Result<Session> {
    let navigator = Arc::new(TerminalNavigator {
        login_url: config.login_url.clone(),
    });
    Session::open(config, navigator, Arc::new(TerminalNotices))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let config = load_config()?;
    let log_dir = (command == "watch")
        .then(|| config.cache_dir().map(|d| d.join("logs")).ok())
        .flatten();
    let _guard = init_tracing(log_dir);

    match command {
        "init" => {
            let url = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("init requires an API base URL"))?;
            init(url)
        }
        "status" => status(&config),
        "import" => import(&config),
        "refresh" => refresh(&config).await,
        "get" => {
            let path = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("get requires a path"))?;
            get(&config, path).await
        }
        "logout" => logout(&config),
        "watch" => watch(&config).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn init(api_base_url: &str) -> Result<()> {
    // Start from the file, not the env-adjusted config, so overrides aren't persisted
    let mut config = Config::load()?;
    config.api_base_url = Some(api_base_url.trim_end_matches('/').to_string());
    config.save()?;
    eprintln!("Saved API base URL {}.", api_base_url);
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = Session::open_store(config)?;
    let report = match store.get() {
        Some(pair) => serde_json::json!({
            "authenticated": true,
            "issued_at": pair.issued_at.with_timezone(&chrono::Local).to_rfc3339(),
            "age": pair.age_display(),
            "backend": config.credential_backend,
        }),
        None => serde_json::json!({
            "authenticated": false,
            "backend": config.credential_backend,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn import(config: &Config) -> Result<()> {
    let access = match std::env::var("TOKENRELAY_ACCESS_TOKEN") {
        Ok(token) => token,
        Err(_) => rpassword::prompt_password("Access token: ").context("Failed to read access token")?,
    };
    let refresh = match std::env::var("TOKENRELAY_REFRESH_TOKEN") {
        Ok(token) => token,
        Err(_) => rpassword::prompt_password("Refresh token: ").context("Failed to read refresh token")?,
    };
    let (access, refresh) = (access.trim(), refresh.trim());
    if access.is_empty() || refresh.is_empty() {
        anyhow::bail!("Both an access token and a refresh token are required");
    }

    let store = Session::open_store(config)?;
    store.set_pair(&TokenPair::new(access, refresh))?;
    info!("Imported token pair");
    eprintln!("Stored credentials ({:?} backend).", config.credential_backend);
    Ok(())
}

async fn refresh(config: &Config) -> Result<()> {
    let session = open_session(config)?;
    session
        .refresher()
        .refresh()
        .await
        .context("Refresh failed; stored credentials were cleared")?;
    eprintln!("Refreshed.");
    Ok(())
}

async fn get(config: &Config, path: &str) -> Result<()> {
    let session = open_session(config)?;
    let client = session.client();
    let response = match client.send(ApiRequest::get(client.url(path))).await {
        Ok(response) => response,
        Err(e @ ApiError::SessionExpired(_)) => {
            // Let the countdown run out so the login redirect happens before exit
            wait_for_expiry(&session).await;
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}

fn logout(config: &Config) -> Result<()> {
    let store = Session::open_store(config)?;
    store.clear()?;
    eprintln!("Logged out.");
    Ok(())
}

async fn watch(config: &Config) -> Result<()> {
    let session = open_session(config)?;
    if !session.is_authenticated() {
        anyhow::bail!("No stored session. Run `tokenrelay import` first.");
    }
    session.start();
    info!(interval_secs = config.refresh_interval_secs, "Watching session");
    eprintln!(
        "Refreshing every {}s. Press Ctrl-C to stop.",
        config.refresh_interval_secs
    );

    let mut states = session.expiry().subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                if *states.borrow_and_update() == SessionExpiryState::Shown {
                    wait_for_expiry(&session).await;
                    break;
                }
            }
        }
    }

    session.teardown();
    info!("Stopped watching session");
    Ok(())
}

/// Show the countdown and wait for the dialog to resolve.
async fn wait_for_expiry(session: &Session) {
    let expiry = session.expiry();
    if let Some(remaining) = expiry.remaining() {
        eprintln!("Your session has expired. Logging out in {}s...", remaining.as_secs());
    }
    expiry.resolved().await;
}
