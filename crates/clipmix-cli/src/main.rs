//! clipmix - command-line front end for the clipmix backend.
//!
//! Stands in for the web UI: it hosts the login surface, shows who is
//! logged in, and sends the user back to login whenever the session
//! manager reports that the session is gone.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use clipmix_core::api::ApiError;
use clipmix_core::auth::LoginError;
use clipmix_core::{ApiClient, Config, LoginExchange, SessionManager, SessionState};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: clipmix <command> [args]

Commands:
  login [email]              Log in with email and password
  signup <email>             Create an account
  google <id-token>          Log in with a Google identity token
  send-link <email> <url>    Email a one-time login link pointing at <url>
  open <url>                 Redeem a one-time login link
  whoami                     Show the logged-in account
  status                     Show session state
  logout                     Forget stored credentials on this device
  delete-account             Delete the account and log out
";

/// Initialize the tracing subscriber for logging.
///
/// Returns the appender guard, which must stay alive for file logging to flush.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // CLIPMIX_LOG_DIR additionally writes a log file there
    let (file_layer, guard) = match std::env::var_os("CLIPMIX_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "clipmix.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
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

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            let mut c = Config::default();
            c.apply_env_overrides();
            c
        }
    };
    info!(backend = %config.backend_url, storage = ?config.storage, "clipmix starting");

    let session = config.session_manager()?;
    let login = LoginExchange::new(session.clone());
    let api = ApiClient::new(session.clone());

    match (command.as_str(), &args[1..]) {
        ("login", rest) => {
            let email = match rest.first() {
                Some(email) => email.clone(),
                None => prompt_email(config.last_email.as_deref())?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            report_login(login.login_with_password(&email, &password).await)?;
            remember_email(&mut config, email);
        }
        ("signup", [email]) => {
            let password = rpassword::prompt_password("Password: ")?;
            let confirm = rpassword::prompt_password("Confirm password: ")?;
            report_login(login.sign_up(email, &password, &confirm).await)?;
            remember_email(&mut config, email.clone());
        }
        ("google", [id_token]) => {
            report_login(login.login_with_google(id_token.clone()).await)?;
        }
        ("send-link", [email, url]) => match login.request_login_link(email, url).await {
            Ok(()) => println!("Check your inbox for a login link."),
            Err(e) => bail!("{}", e),
        },
        ("open", [link]) => {
            let url = url::Url::parse(link).context("Invalid URL")?;
            match login.redeem_otp_link(&url).await {
                Some(redemption) => {
                    if redemption.logged_in {
                        println!("Login successful!");
                    } else {
                        println!("That login link is no longer valid. Please log in again.");
                    }
                    println!("Continue at {}", redemption.cleaned_url);
                }
                None => println!("No login link found in {}", url),
            }
        }
        ("whoami", []) => match api.user_info().await {
            Ok(user) => println!("{}", user.email),
            Err(e) => return handle_api_error(e),
        },
        ("status", []) => print_status(&session),
        ("logout", []) => {
            session.logout();
            println!("Logged out.");
        }
        ("delete-account", []) => {
            print!("Delete your account and all of its audio? [y/N]: ");
            io::stdout().flush()?;
            let mut input = String::new();
            io::stdin().read_line(&mut input)?;
            if input.trim().eq_ignore_ascii_case("y") {
                match api.delete_account().await {
                    Ok(()) => println!("Account deleted."),
                    Err(e) => return handle_api_error(e),
                }
            }
        }
        _ => {
            eprint!("{}", USAGE);
            bail!("Unknown command or wrong arguments: {}", args.join(" "));
        }
    }

    Ok(())
}

fn prompt_email(last_email: Option<&str>) -> Result<String> {
    match last_email {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), last_email) {
        (true, Some(last)) => Ok(last.to_string()),
        _ => Ok(input.to_string()),
    }
}

fn remember_email(config: &mut Config, email: String) {
    config.last_email = Some(email.trim().to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

fn report_login(result: Result<(), LoginError>) -> Result<()> {
    match result {
        Ok(()) => {
            println!("Login successful!");
            Ok(())
        }
        Err(e) => bail!("{}", e),
    }
}

/// Send the user back to the login surface when the session is gone.
fn handle_api_error(err: ApiError) -> Result<()> {
    match err {
        ApiError::Unauthenticated => {
            bail!("Your session has ended. Run `clipmix login` to sign in again.")
        }
        other => Err(other.into()),
    }
}

fn print_status(session: &SessionManager) {
    let state = match session.state() {
        SessionState::LoggedOut => "logged out",
        SessionState::NoSession => "logged in (session not yet issued)",
        SessionState::Renewing => "logged in (renewing session)",
        SessionState::Active => "logged in",
    };
    println!("Session: {}", state);
    if session.storage_degraded() {
        println!("Warning: credential storage is unavailable; this login will not be remembered.");
    }
}
