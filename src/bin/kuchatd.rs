//! ku-chat daemon - real-time connection and message-routing server
//!
//! Accepts client sockets, keeps one live connection per user and routes
//! inbound frames to handlers, which may push events to other online users.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! kuchatd start
//!
//! # Stop the daemon
//! kuchatd stop
//!
//! # Check daemon status
//! kuchatd status
//!
//! # Print the effective configuration
//! kuchatd config
//!
//! # Start on a custom address
//! KUCHAT_LISTEN=0.0.0.0:9000 kuchatd start
//!
//! # Enable debug logging
//! RUST_LOG=kuchatd=debug kuchatd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kuchatd::config::{Config, CONFIG_ENV, LISTEN_ENV};
use kuchatd::{default_dispatcher, spawn_idle_reaper, ChatServer, Hub, Registry};

/// ku-chat daemon - connection registry and push delivery
#[derive(Parser, Debug)]
#[command(name = "kuchatd", version, about)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(short, long, global = true, env = LISTEN_ENV)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start,
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Print the effective configuration
    Config,
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kuchat")
        .join("kuchatd.pid")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{}", pid)).exists()
}

/// Returns the daemon's PID if it is running, removing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Loads the config file and applies the CLI override.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(listen) = &args.listen {
        config.server.listen = listen.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.as_ref().unwrap_or(&Command::Start) {
        Command::Start => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {})", pid);
                eprintln!("Use 'kuchatd stop' to stop it first.");
                process::exit(1);
            }

            let config = load_config(&args)?;

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {})...", pid);
                stop_daemon(pid)?;

                // Wait for process to exit (up to 5 seconds)
                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {})", pid);
                if let Ok(config) = load_config(&args) {
                    println!("Listen: {}", config.server.listen);
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
        Command::Config => {
            let config = load_config(&args)?;
            print!("{}", config.to_toml().context("Failed to render config")?);
            Ok(())
        }
    }
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("kuchatd=info".parse()?)
                .add_directive("kuchat_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "ku-chat daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = Registry::with_config(&config.registry);
    let dispatcher = default_dispatcher(&registry).context("Failed to build handler table")?;
    info!(kinds = ?dispatcher.kinds(), "Handlers registered");

    let _reaper_handle = config.registry.idle_timeout().map(|max_idle| {
        info!(max_idle_secs = max_idle.as_secs(), "Idle reaper started");
        spawn_idle_reaper(
            registry.clone(),
            config.registry.reap_interval(),
            max_idle,
            cancel_token.clone(),
        )
    });

    let hub = Hub::new(registry, dispatcher, config.connection.clone());
    let server = ChatServer::bind(&config.server, hub, cancel_token).await?;

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("ku-chat daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
