//! esync: zero-knowledge, end-to-end encrypted file synchronization
//!
//! Thin CLI over the sync engine:
//! - native filesystem watching with debounce + settle
//! - content-defined chunking (FastCDC) with chunk-level resume
//! - AES-256-GCM encryption, keys derived client-side via Argon2id
//! - Server-Wins + Local-Preserved conflict handling

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{builder::Styles, Parser, Subcommand};
use color_eyre::Result;
use tracing::{error, info};

use esync_core::config::{sanitize_machine_name, AgentConfig};
use esync_core::keystore::{Keystore, KeystoreError};
use esync_engine::agent::{AgentOptions, SyncAgent};
use esync_engine::status::LogNotifier;
use esync_remote::api::RemoteApi;
use esync_remote::http::HttpRemote;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

// Exit codes surfaced by the CLI
const EXIT_OK: u8 = 0;
const EXIT_USER: u8 = 1;
const EXIT_INTERNAL: u8 = 2;
const EXIT_NOT_INITIALIZED: u8 = 3;

#[derive(Parser)]
#[command(name = "esync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Zero-knowledge encrypted file sync")]
#[command(long_about = r#"
esync keeps a local folder in sync across machines through a central server
that only ever sees ciphertext.

Examples:
  esync init --server-url https://sync.example.com --auth-token TOKEN
  esync sync                One sync pass, then exit
  esync run                 Run the agent until interrupted
  esync key export          Print the content key for another device
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Master password (falls back to $ESYNC_PASSWORD)
    #[arg(long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config and keystore
    Init {
        /// Server base URL
        #[arg(long)]
        server_url: String,

        /// Authentication token issued at registration
        #[arg(long)]
        auth_token: String,

        /// Folder to keep in sync (default: ~/EsyncFolder)
        #[arg(long)]
        sync_folder: Option<PathBuf>,

        /// Machine name used in conflict file names
        #[arg(long)]
        machine_name: Option<String>,

        /// Import an exported content key instead of generating one
        #[arg(long)]
        import_key: Option<String>,
    },

    /// Run the agent until interrupted
    Run,

    /// One sync pass: scan, drain the queue, report
    Sync,

    /// Show agent configuration and tracked-state summary
    Status,

    /// Content key operations
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Print the content key as base64 (for setting up another device)
    Export,
}

fn main() -> ExitCode {
    if color_eyre::install().is_err() {
        return ExitCode::from(EXIT_INTERNAL);
    }

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match dispatch(cli) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.code)
        }
    }
}

/// Error carrying the process exit code
struct CliError {
    code: u8,
    message: String,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

fn user(message: impl Into<String>) -> CliError {
    CliError {
        code: EXIT_USER,
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> CliError {
    CliError {
        code: EXIT_INTERNAL,
        message: message.into(),
    }
}

fn not_initialized(message: impl Into<String>) -> CliError {
    CliError {
        code: EXIT_NOT_INITIALIZED,
        message: message.into(),
    }
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    let home = AgentConfig::home_dir();

    match cli.command {
        Commands::Init {
            server_url,
            auth_token,
            sync_folder,
            machine_name,
            import_key,
        } => {
            let password = resolve_password(cli.password.as_deref())?;

            let mut config = AgentConfig::default();
            config.server_url = server_url;
            config.auth_token = auth_token;
            if let Some(folder) = sync_folder {
                config.sync_folder = folder;
            }
            if let Some(name) = machine_name {
                config.machine_name = sanitize_machine_name(&name);
            }
            config
                .save(&home)
                .map_err(|e| internal(format!("cannot write config: {e}")))?;

            let keystore = match import_key {
                Some(key) => Keystore::import(&home, &key, &password),
                None => Keystore::create(&home, &password),
            }
            .map_err(|e| match e {
                KeystoreError::AlreadyExists(_) | KeystoreError::InvalidKey(_) => {
                    user(e.to_string())
                }
                other => internal(other.to_string()),
            })?;

            std::fs::create_dir_all(&config.sync_folder)
                .map_err(|e| internal(format!("cannot create sync folder: {e}")))?;

            info!(
                home = %home.display(),
                sync_folder = %config.sync_folder.display(),
                key_id = keystore.key_id(),
                "initialized"
            );
            Ok(())
        }

        Commands::Run => {
            let (config, key) = load_and_unlock(&home, cli.password.as_deref())?;
            let remote = build_remote(&config)?;
            let agent = SyncAgent::start(
                &home,
                &config,
                key,
                remote,
                Arc::new(LogNotifier),
                AgentOptions::default(),
            )
            .map_err(|e| internal(format!("agent failed to start: {e}")))?;

            wait_for_shutdown_signal();
            agent.stop();
            Ok(())
        }

        Commands::Sync => {
            let (config, key) = load_and_unlock(&home, cli.password.as_deref())?;
            let remote = build_remote(&config)?;
            let agent = SyncAgent::start(
                &home,
                &config,
                key,
                remote,
                Arc::new(LogNotifier),
                AgentOptions::one_shot(),
            )
            .map_err(|e| internal(format!("agent failed to start: {e}")))?;

            let result = agent.sync_once(Duration::from_secs(600));
            agent.stop();

            let summary = result.map_err(|e| internal(e.to_string()))?;
            info!(
                uploaded = summary.uploaded,
                downloaded = summary.downloaded,
                deleted = summary.deleted,
                conflicts = summary.conflicts,
                failures = summary.failures,
                "sync pass complete"
            );
            if summary.failures > 0 {
                return Err(internal("some transfers failed; see log"));
            }
            Ok(())
        }

        Commands::Status => {
            let config = AgentConfig::load(&home)
                .map_err(|e| not_initialized(format!("{e}; run `esync init` first")))?;
            let state = esync_engine::state::LocalState::open(&home.join("state"))
                .map_err(|e| internal(e.to_string()))?;
            let records = state.iter_all().map_err(|e| internal(e.to_string()))?;
            let total_bytes: u64 = records.iter().map(|r| r.local_size).sum();

            info!(
                server = %config.server_url,
                sync_folder = %config.sync_folder.display(),
                machine = %config.machine_name,
                tracked_files = records.len(),
                tracked_bytes = total_bytes,
                change_cursor = %state.change_cursor().unwrap_or_else(|| "-".into()),
                "status"
            );
            Ok(())
        }

        Commands::Key { command } => match command {
            KeyCommands::Export => {
                let password = resolve_password(cli.password.as_deref())?;
                let mut keystore = Keystore::load(&home).map_err(|e| match e {
                    KeystoreError::NotInitialized(_) => {
                        not_initialized(format!("{e}; run `esync init` first"))
                    }
                    other => internal(other.to_string()),
                })?;
                keystore.unlock(&password).map_err(|e| match e {
                    KeystoreError::BadPassword => user("invalid password"),
                    other => internal(other.to_string()),
                })?;
                let exported = keystore.export().map_err(|e| internal(e.to_string()))?;
                println!("{exported}");
                keystore.lock();
                Ok(())
            }
        },
    }
}

fn resolve_password(flag: Option<&str>) -> Result<String, CliError> {
    if let Some(password) = flag {
        return Ok(password.to_string());
    }
    std::env::var("ESYNC_PASSWORD")
        .map_err(|_| user("no password given: use --password or set ESYNC_PASSWORD"))
}

fn load_and_unlock(
    home: &std::path::Path,
    password_flag: Option<&str>,
) -> Result<(AgentConfig, [u8; 32]), CliError> {
    let config = AgentConfig::load(home)
        .map_err(|e| not_initialized(format!("{e}; run `esync init` first")))?;

    let password = resolve_password(password_flag)?;
    let mut keystore = Keystore::load(home).map_err(|e| match e {
        KeystoreError::NotInitialized(_) => not_initialized(format!("{e}; run `esync init` first")),
        other => internal(other.to_string()),
    })?;
    keystore.unlock(&password).map_err(|e| match e {
        KeystoreError::BadPassword => user("invalid password"),
        other => internal(other.to_string()),
    })?;
    let key = *keystore
        .key()
        .map_err(|e| internal(e.to_string()))?;
    keystore.lock();

    Ok((config, key))
}

fn build_remote(config: &AgentConfig) -> Result<Arc<dyn RemoteApi>, CliError> {
    let remote = HttpRemote::new(
        &config.server_url,
        &config.auth_token,
        Duration::from_secs(config.connect_timeout_secs),
        Duration::from_secs(config.read_timeout_secs),
    )
    .map_err(|e| internal(format!("cannot build http client: {e}")))?;
    Ok(Arc::new(remote))
}

#[cfg(unix)]
fn wait_for_shutdown_signal() {
    use std::sync::atomic::{AtomicBool, Ordering};

    static SHUTDOWN: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_signal: libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    // SAFETY: installing a minimal async-signal-safe handler
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    info!("running; press Ctrl+C to stop");
    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("shutdown signal received");
}

#[cfg(not(unix))]
fn wait_for_shutdown_signal() {
    info!("running; terminate the process to stop");
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
