use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, time::Duration};
use tandem_core::{
    telemetry::{env_true, init_logging, resolve_setting, LogConfig, DEFAULT_LOG_DIR},
    DEFAULT_EPOCH, DEFAULT_RELAY_PORTS,
};
use tandem_relay::{serve, RelayConfig};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tandem-relay")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Global minimum epoch; 0 falls back to TANDEM_RELAY_MIN_EPOCH.
    #[arg(long, default_value_t = 0)]
    min_epoch: u32,
    /// Per-namespace minimum epoch, `namespace=epoch`. Repeatable.
    #[arg(long = "namespace-epoch")]
    namespace_epochs: Vec<String>,
    #[arg(long, default_value = "")]
    registry_dir: String,
    #[arg(long, default_value_t = false)]
    no_registry: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

fn default_relay_addr() -> String {
    let port = DEFAULT_RELAY_PORTS.first().copied().unwrap_or(4444);
    format!("127.0.0.1:{port}")
}

fn default_registry_dir() -> String {
    match std::env::var("HOME") {
        Ok(home) if !home.trim().is_empty() => PathBuf::from(home)
            .join(".tandem")
            .join("relays")
            .to_string_lossy()
            .into_owned(),
        _ => ".tandem/relays".to_string(),
    }
}

fn resolve_min_epoch(flag: u32) -> Result<u32> {
    if flag > 0 {
        return Ok(flag);
    }
    match std::env::var("TANDEM_RELAY_MIN_EPOCH") {
        Ok(value) if !value.trim().is_empty() => {
            let epoch = value
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid TANDEM_RELAY_MIN_EPOCH '{value}'"))?;
            if epoch < 1 {
                bail!("TANDEM_RELAY_MIN_EPOCH must be >= 1");
            }
            Ok(epoch)
        }
        _ => Ok(DEFAULT_EPOCH),
    }
}

fn parse_namespace_epochs(raw: &[String]) -> Result<HashMap<String, u32>> {
    let mut epochs = HashMap::new();
    for item in raw {
        let (namespace, epoch) = item
            .split_once('=')
            .with_context(|| format!("expected namespace=epoch, got '{item}'"))?;
        let namespace = namespace.trim();
        if namespace.is_empty() || namespace.contains(':') {
            bail!("invalid namespace in '{item}'");
        }
        let epoch = epoch
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid epoch in '{item}'"))?;
        if epoch < 1 {
            bail!("epoch must be >= 1 in '{item}'");
        }
        epochs.insert(namespace.to_string(), epoch);
    }
    Ok(epochs)
}

fn load_config(args: &Args) -> Result<(SocketAddr, RelayConfig, LogConfig)> {
    let addr_raw = resolve_setting(&args.addr, "TANDEM_RELAY_ADDR", &default_relay_addr());
    let addr: SocketAddr = addr_raw
        .parse()
        .with_context(|| format!("invalid relay address '{addr_raw}'"))?;
    if !addr.ip().is_loopback() {
        bail!("relay must bind a loopback address, got {addr}");
    }
    let debug = args.debug || env_true("TANDEM_RELAY_DEBUG");
    let registry_dir = if args.no_registry {
        None
    } else {
        Some(PathBuf::from(resolve_setting(
            &args.registry_dir,
            "TANDEM_REGISTRY_DIR",
            &default_registry_dir(),
        )))
    };
    let config = RelayConfig {
        min_epoch: resolve_min_epoch(args.min_epoch)?,
        namespace_min_epochs: parse_namespace_epochs(&args.namespace_epochs)?,
        registry_dir,
        stale_seconds: args.stale_seconds,
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        debug,
        ..RelayConfig::default()
    };
    let log = LogConfig {
        log_dir: resolve_setting(&args.log_dir, "TANDEM_LOG_DIR", DEFAULT_LOG_DIR),
        file_stem: format!("tandem-relay-{}", addr.port()),
        debug,
        stdout: true,
    };
    Ok((addr, config, log))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (addr, config, log) = load_config(&args)?;
    let _log_guard = init_logging(&log);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_error", addr = %addr, error = %err);
            return Err(err).with_context(|| format!("bind {addr}"));
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    serve(listener, config, shutdown_rx)
        .await
        .context("relay server failed")
}
