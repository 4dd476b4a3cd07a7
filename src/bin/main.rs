//! dnsroute binary entry point.

use clap::Parser;
use dnsroute::{telemetry, Command, Config, Server};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Announces host routes for IPs resolved from watched domains.
#[derive(Parser, Debug)]
#[command(name = "dnsroute")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "dnsroute.toml")]
    config: PathBuf,
}

/// Translate OS signals into control commands.
///
/// SIGHUP reloads the watch-list, SIGUSR1 logs stats, SIGINT and SIGTERM
/// shut down.
async fn forward_signals(commands: mpsc::Sender<Command>) -> std::io::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        let command = tokio::select! {
            _ = hangup.recv() => Command::Reload,
            _ = user1.recv() => Command::Stats(None),
            _ = interrupt.recv() => Command::Shutdown,
            _ = terminate.recv() => Command::Shutdown,
        };
        let shutdown = matches!(command, Command::Shutdown);
        if commands.send(command).await.is_err() || shutdown {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("DNSROUTE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        domains = %config.domains.display(),
        ttl = config.ttl,
        peers = config.replication.peers.len(),
        "Starting dnsroute"
    );

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {}", e);
            telemetry::shutdown();
            return Err(e.into());
        }
    };

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        if let Err(e) = forward_signals(tx).await {
            error!("unable to install signal handlers: {}", e);
        }
    });

    let result = server.run(rx, cancel).await;

    telemetry::shutdown();

    if let Err(e) = result {
        error!("dnsroute error: {}", e);
        return Err(e.into());
    }

    info!("dnsroute shutdown complete");
    Ok(())
}
