//! dirshare
//!
//! Serve a directory tree over TCP, or browse, pull from and push to a
//! remote dirshare server.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dirshare::config::Config;
use dirshare::protocol::chunk::Progress;
use dirshare::{BoundedAcceptor, ClientOutcome, RemoteClient, RequestDispatcher};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// dirshare - browse a remote directory tree and push/pull files over TCP.
#[derive(Parser, Debug)]
#[command(name = "dirshare")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving the local filesystem
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long, short, value_parser = parse_port)]
        port: Option<u16>,

        /// Address to bind (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Maximum number of connections handled at once
        #[arg(long, value_name = "N")]
        max_connections: Option<usize>,
    },

    /// List a remote directory
    Ls {
        /// Server address (HOST:PORT)
        #[arg(value_parser = parse_address)]
        address: String,

        /// Remote directory ("." is the server's start directory)
        #[arg(default_value = ".")]
        path: String,
    },

    /// Download a remote file
    Pull {
        /// Server address (HOST:PORT)
        #[arg(value_parser = parse_address)]
        address: String,

        /// Remote file path
        remote_path: String,

        /// Local directory to save into
        #[arg(long, short, default_value = ".")]
        dest: PathBuf,
    },

    /// Upload a local file into a remote directory
    Push {
        /// Server address (HOST:PORT)
        #[arg(value_parser = parse_address)]
        address: String,

        /// Local file to upload
        local_file: PathBuf,

        /// Remote target directory
        remote_dir: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Config loading logs through a stderr subscriber until the
    // configured one is installed
    let bootstrap = bootstrap_subscriber(cli.verbose, std::io::stderr);
    let config = tracing::subscriber::with_default(bootstrap, || load_config(&cli))?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let _log_guard = init_tracing(level, config.daemon.log_file.as_deref())?;

    match cli.command {
        Commands::Serve { .. } => run_server(&config).await,
        Commands::Ls { address, path } => list(&config, &address, &path).await,
        Commands::Pull {
            address,
            remote_path,
            dest,
        } => pull(&config, &address, &remote_path, &dest).await,
        Commands::Push {
            address,
            local_file,
            remote_dir,
        } => push(&config, &address, &local_file, &remote_dir).await,
    }
}

/// Load the config file, then apply environment and command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    if let Commands::Serve {
        port,
        bind,
        max_connections,
    } = &cli.command
    {
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(bind) = bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(max) = max_connections {
            config.server.max_connections = *max;
        }
    }

    config.validate()?;
    Ok(config)
}

/// Subscriber used while the configuration is being loaded.
fn bootstrap_subscriber<W>(verbose: bool, writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(writer)
        .with_ansi(false)
        .finish()
}

/// Install the tracing subscriber, writing to `log_file` when set.
///
/// The returned guard must be held until exit so buffered lines are flushed.
fn init_tracing(level: &str, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("log_file has no file name: {}", path.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Serve until SIGINT or SIGTERM.
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let addr = config.server.socket_addr()?;
    let dispatcher = RequestDispatcher::from_config(config);

    let acceptor =
        BoundedAcceptor::start(addr, config.server.max_connections, Arc::new(dispatcher)).await?;
    println!("Serving on {}", acceptor.local_addr());

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    acceptor.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

async fn list(config: &Config, address: &str, path: &str) -> anyhow::Result<()> {
    let client = RemoteClient::from_config(address, config);
    let listing = finish(client.list_directory(path).await, address)?;

    if let Some(listing) = listing {
        for entry in listing.entries() {
            if entry.is_directory {
                println!("{}/", entry.name);
            } else {
                println!("{}", entry.name);
            }
        }
    }
    Ok(())
}

async fn pull(config: &Config, address: &str, remote_path: &str, dest: &Path) -> anyhow::Result<()> {
    let client = RemoteClient::from_config(address, config);
    let cancel = cancel_on_ctrl_c();

    let outcome = client
        .pull_file(remote_path, dest, cancel, print_progress)
        .await;
    eprintln!();

    if let Some(path) = finish(outcome, address)? {
        println!("Saved {}", path.display());
    }
    Ok(())
}

async fn push(
    config: &Config,
    address: &str,
    local_file: &Path,
    remote_dir: &str,
) -> anyhow::Result<()> {
    let client = RemoteClient::from_config(address, config);
    let cancel = cancel_on_ctrl_c();

    let outcome = client
        .push_file(local_file, remote_dir, cancel, print_progress)
        .await;
    eprintln!();

    if let Some(bytes) = finish(outcome, address)? {
        println!("Sent {} bytes", bytes);
    }
    Ok(())
}

/// Cancel the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

fn print_progress(progress: Progress) {
    match progress.percent() {
        Some(percent) => eprint!("\r{:>3}%", percent),
        None => eprint!("\r{} bytes", progress.transferred),
    }
    let _ = std::io::stderr().flush();
}

/// Turn an outcome into the command's result. Cancellation is not an error.
fn finish<T>(outcome: ClientOutcome<T>, address: &str) -> anyhow::Result<Option<T>> {
    match outcome {
        ClientOutcome::Success(value) => Ok(Some(value)),
        ClientOutcome::Refused => anyhow::bail!("Request refused by {}", address),
        ClientOutcome::Cancelled { transferred } => {
            eprintln!("Cancelled after {} bytes", transferred);
            Ok(None)
        }
        ClientOutcome::Failed(e) => Err(e).with_context(|| format!("Request to {} failed", address)),
    }
}

/// Parse a port number in 1..=65535.
fn parse_port(value: &str) -> Result<u16, String> {
    let port: i64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid port: {:?}", value))?;
    if !(1..=65535).contains(&port) {
        return Err(format!("port out of range (1-65535): {}", port));
    }
    Ok(port as u16)
}

/// Check a `HOST:PORT` server address.
fn parse_address(value: &str) -> Result<String, String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got {:?}", value))?;
    if host.is_empty() {
        return Err(format!("missing host in {:?}", value));
    }
    parse_port(port)?;
    Ok(value.to_string())
}
