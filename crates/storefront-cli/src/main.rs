//! Storefront CLI - log in, inspect and renew the storefront session from a
//! terminal, and issue authenticated requests through the session gateway.

use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storefront_session::{AuthContext, Config, HttpAuthService};

// ============================================================================
// Constants
// ============================================================================

/// Directory for a daily-rolling log file, in addition to stderr
const LOG_DIR_ENV: &str = "STOREFRONT_LOG_DIR";

const LOG_FILE_PREFIX: &str = "storefront.log";

const USAGE: &str = "\
Usage: storefront <command>

Commands:
  status          Show the current session
  login [email]   Log in (prompts for the password)
  logout          End the session and forget stored credentials
  refresh         Renew the access token now
  get <path>      GET an API path with the session's credentials
";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Status,
    Login(Option<String>),
    Logout,
    Refresh,
    Get(String),
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut args = args.iter().map(String::as_str);
    let command = match args.next() {
        None | Some("status") => Command::Status,
        Some("login") => Command::Login(args.next().map(str::to_string)),
        Some("logout") => Command::Logout,
        Some("refresh") => Command::Refresh,
        Some("get") => {
            let path = args.next().ok_or_else(|| anyhow::anyhow!("get requires a path"))?;
            Command::Get(path.to_string())
        }
        Some("help") | Some("--help") | Some("-h") => Command::Help,
        Some(other) => anyhow::bail!("Unknown command: {}\n\n{}", other, USAGE),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("Unexpected argument: {}", extra);
    }
    Ok(command)
}

/// Initialize the tracing subscriber for logging.
///
/// The returned guard must stay alive for the file writer to flush.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Help {
        print!("{}", USAGE);
        return Ok(());
    }

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };

    let (ctx, auth) = AuthContext::from_config(&config)?;
    let restored = ctx.hydrate();
    debug!(restored, "Session hydrated");

    match command {
        Command::Status => print_status(&ctx),
        Command::Login(email) => login(&ctx, &auth, &mut config, email).await?,
        Command::Logout => {
            ctx.logout();
            println!("Logged out");
        }
        Command::Refresh => {
            ctx.refresh().await.context("Renewal failed")?;
            println!("Session renewed");
            print_status(&ctx);
        }
        Command::Get(path) => {
            let body: serde_json::Value = ctx.gateway().get_json(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Help => {}
    }

    Ok(())
}

fn format_instant(instant: Option<DateTime<Utc>>) -> String {
    instant
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_status(ctx: &AuthContext) {
    let session = ctx.session();
    let Some(access) = session.access_credential() else {
        println!("Not logged in");
        return;
    };

    let schedule = ctx.store().schedule();
    if let Some(user) = session.user() {
        let role = if user.is_admin() { " (admin)" } else { "" };
        println!("User:             {}{}", user.label(), role);
    }
    println!("Session id:       {}", session.session_id().unwrap_or("-"));
    println!("Token expires:    {}", format_instant(schedule.clock().expires_at(access)));
    println!("Renewal at:       {}", format_instant(schedule.armed_deadline()));
    println!(
        "Renewable:        {}",
        if session.renewal_credential().is_some() { "yes" } else { "no" }
    );
}

fn prompt_email() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    Ok(email.trim().to_string())
}

async fn login(
    ctx: &AuthContext,
    auth: &HttpAuthService,
    config: &mut Config,
    email: Option<String>,
) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt_email()?,
    };
    if email.is_empty() {
        anyhow::bail!("Email required");
    }
    let password = rpassword::prompt_password(format!("Password for {}: ", email))?;
    if password.is_empty() {
        anyhow::bail!("Password required");
    }

    let session = auth.login(&email, &password).await.context("Login failed")?;
    ctx.establish(session);

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    info!("Logged in");
    print_status(ctx);
    Ok(())
}
