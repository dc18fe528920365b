//! pipesocks server
//!
//! Binds the pipe endpoint, then multiplexes controller-issued SOCKS5/TCP
//! sessions over accepted pipe instances until told to stop.

use anyhow::{Context, Result};
use clap::Parser;
use pipesocks::socks::SocksEngine;
use pipesocks::transport::{PipeServer, TcpAcceptor, TransportError};
use pipesocks::worker::Worker;
use pipesocks::{Config, StopSignal};
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::{error, info};

// exit codes surfaced to the invoking process
const EXIT_ERROR: u8 = 1;
const EXIT_ALREADY_RUNNING: u8 = 3;
const EXIT_API: u8 = 4;

/// SOCKS-over-pipe tunnel server
#[derive(Parser, Debug)]
#[command(name = "pipesocks-server")]
#[command(about = "Server half of a multiplexed SOCKS5-over-pipe tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Local pipe endpoint path (overrides config)
    #[arg(short, long)]
    pipe: Option<String>,

    /// TCP listen address for remote controllers (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // a bad command line exits through clap with its own code (2)
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(classify_error(&e))
        }
    }
}

/// Map a failure to the documented exit codes: 3 when the endpoint is held
/// by another instance, 4 for OS API failures, 1 otherwise.
fn classify_error(e: &anyhow::Error) -> u8 {
    if let Some(TransportError::Bind { source, .. }) = e.downcast_ref::<TransportError>() {
        return if source.kind() == std::io::ErrorKind::AddrInUse {
            EXIT_ALREADY_RUNNING
        } else {
            EXIT_API
        };
    }
    if e.downcast_ref::<std::io::Error>().is_some() {
        return EXIT_API;
    }
    EXIT_ERROR
}

async fn run(args: Args) -> Result<()> {
    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    if let Some(pipe) = args.pipe {
        config.pipe.path = Some(pipe);
    }
    if let Some(listen) = args.listen {
        config.pipe.listen = Some(listen);
    }

    info!("pipesocks server v{}", pipesocks::VERSION);

    let stop = StopSignal::new();

    let (pipe_tx, pipe_rx) = mpsc::unbounded_channel();
    let pipe = PipeServer::new(pipe_tx, stop.clone());

    let (socks_tx, socks_rx) = mpsc::unbounded_channel();
    let engine = SocksEngine::new(socks_tx, config.socks.engine_config(), stop.clone());

    let worker = Worker::new(pipe.clone(), pipe_rx, engine, socks_rx, stop.clone());

    // local endpoint cleanup happens on the way out
    let mut unix_path: Option<std::path::PathBuf> = None;

    if let Some(listen) = &config.pipe.listen {
        let acceptor = TcpAcceptor::bind(listen).await?;
        info!("listening on tcp {}", listen);
        pipe.launch(acceptor);
    } else {
        #[cfg(unix)]
        {
            let path = config.pipe.effective_path();
            let acceptor = pipesocks::transport::UnixAcceptor::bind(&path)?;
            info!("listening on pipe {}", path.display());
            pipe.launch(acceptor);
            unix_path = Some(path);
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("no pipe endpoint available; configure pipe.listen");
        }
    }

    let worker_task = tokio::spawn(worker.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            stop.trigger();
        }
        _ = stop.wait() => {
            // stopped from inside (controller-driven uninstall)
        }
    }

    let _ = worker_task.await;

    if let Some(path) = unix_path.take() {
        let _ = std::fs::remove_file(path);
    }

    Ok(())
}
