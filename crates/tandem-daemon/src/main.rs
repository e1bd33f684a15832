use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use futures_util::future::join_all;
use std::path::PathBuf;
use tandem_core::{
    process::pid_is_alive,
    telemetry::{env_true, init_logging, resolve_setting, LogConfig, DEFAULT_LOG_DIR},
};
use tandem_daemon::{
    config::{config_path, load_file_config, resolve_state_dir, ConfigOverrides},
    lock::DEFAULT_MAX_RETRIES,
    follow_document, DaemonConfig, DocumentRef, EpochRecoveryStore, FollowExit, LockOutcome,
    SingletonLock,
};
use tandem_storage::ReplicaCache;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tandem-daemon")]
struct Cli {
    /// Defaults to TANDEM_STATE_DIR, then ~/.tandem.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow documents and dispatch agent runs (default).
    Run(RunArgs),
    /// Print lock holder, current epoch and cached documents.
    Status,
    /// Wipe the local cache of `namespace:key` and clear its reset counter.
    ResetCache { document: String },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Document to follow, `namespace:key`. Repeatable.
    #[arg(long = "document")]
    documents: Vec<String>,
    #[arg(long = "relay-port")]
    relay_ports: Vec<u16>,
    /// Relay base URL used in addition to discovery. Repeatable.
    #[arg(long = "relay-url")]
    relay_urls: Vec<String>,
    /// Peer daemon UDP address. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long)]
    peer_bind: Option<String>,
    /// Command started for each new user turn, split on whitespace.
    #[arg(long)]
    agent_command: Option<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    lock_retries: u32,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            relay_ports: Vec::new(),
            relay_urls: Vec::new(),
            peers: Vec::new(),
            peer_bind: None,
            agent_command: None,
            lock_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            documents: self.documents.clone(),
            relay_ports: self.relay_ports.clone(),
            relay_urls: self.relay_urls.clone(),
            peers: self.peers.clone(),
            peer_bind: self.peer_bind.clone(),
            agent_command: self.agent_command.clone(),
        }
    }
}

fn load_config(state_dir: PathBuf, args: &RunArgs) -> Result<DaemonConfig> {
    let path = config_path(&state_dir);
    let file = load_file_config(&path)?;
    DaemonConfig::resolve(state_dir, file, args.overrides())
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

fn log_config(cli: &Cli, stdout: bool) -> LogConfig {
    LogConfig {
        log_dir: resolve_setting(&cli.log_dir, "TANDEM_LOG_DIR", DEFAULT_LOG_DIR),
        file_stem: "tandem-daemon".to_string(),
        debug: cli.debug || env_true("TANDEM_DAEMON_DEBUG"),
        stdout,
    }
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

async fn run(state_dir: PathBuf, args: RunArgs) -> Result<()> {
    let config = load_config(state_dir, &args)?;

    let lock = SingletonLock::new(&config.state_dir);
    let retries = args.lock_retries;
    let outcome = tokio::task::spawn_blocking(move || lock.try_acquire(retries))
        .await
        .context("lock task failed")??;
    let guard = match outcome {
        LockOutcome::Acquired(guard) => guard,
        LockOutcome::Held { pid } => {
            println!("tandem-daemon is already running (pid {pid})");
            return Ok(());
        }
        LockOutcome::Starting => {
            println!("tandem-daemon is already starting");
            return Ok(());
        }
        LockOutcome::Contended => {
            bail!("could not take the daemon lock: stale lock kept reappearing");
        }
    };

    let mut store = EpochRecoveryStore::open(&config.ledger_path(), config.cache_path())
        .context("open epoch ledger")?;
    if let Some(entry) = &config.entry_document {
        let epoch = store.current_epoch().await?;
        store = store.with_entry(entry.at_epoch(epoch)?);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    if config.documents.is_empty() {
        warn!(event = "no_documents", "no documents configured; idling until shutdown");
    }
    info!(
        event = "daemon_start",
        pid = guard.record().holder_pid,
        documents = config.documents.len(),
        state_dir = %config.state_dir.display()
    );

    let followers = config.documents.iter().map(|document| {
        let document = document.clone();
        let name = document.to_string();
        let task = tokio::spawn(follow_document(
            document,
            store.clone(),
            config.orchestrator_config(),
            config.agent_command.clone(),
            shutdown_rx.clone(),
        ));
        async move { (name, task.await) }
    });
    let idle = {
        let mut shutdown = shutdown_rx.clone();
        async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        }
    };
    let (results, _) = tokio::join!(join_all(followers), idle);
    for (document, result) in results {
        match result {
            Ok(FollowExit::Shutdown) => {}
            Ok(FollowExit::Exhausted) => {
                error!(event = "document_abandoned", document = %document)
            }
            Ok(FollowExit::Failed(reason)) => {
                error!(event = "document_failed", document = %document, reason = %reason)
            }
            Err(err) => error!(event = "document_task_panicked", document = %document, error = %err),
        }
    }

    tokio::task::spawn_blocking(move || guard.release())
        .await
        .context("lock task failed")??;
    info!(event = "daemon_stop");
    Ok(())
}

async fn status(state_dir: PathBuf) -> Result<()> {
    let lock = SingletonLock::new(&state_dir);
    match lock.read_record()? {
        Some(record) if pid_is_alive(record.holder_pid) => {
            let since = DateTime::<Utc>::from_timestamp_millis(record.acquired_at_ms)
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            println!("daemon: running (pid {}, since {since})", record.holder_pid)
        }
        Some(record) => println!("daemon: stale lock (pid {} not running)", record.holder_pid),
        None => println!("daemon: not running"),
    }

    let config = load_config(state_dir, &RunArgs::default())?;
    let store = EpochRecoveryStore::open(&config.ledger_path(), config.cache_path())?;
    println!("epoch: {}", store.current_epoch().await?);

    let cache_path = config.cache_path();
    let documents = tokio::task::spawn_blocking(move || {
        ReplicaCache::open(&cache_path).and_then(|cache| cache.documents())
    })
    .await
    .context("cache task failed")??;
    for cached in documents {
        let attempts = store.reset_attempts(&cached.doc_key).await?;
        let dispatched = store.dispatch_count(&cached.doc_key).await?;
        println!(
            "{}:{} updates={} reset_attempts={} dispatched={}",
            cached.doc_key, cached.epoch, cached.update_count, attempts, dispatched
        );
    }
    Ok(())
}

async fn reset_cache(state_dir: PathBuf, document: &str) -> Result<()> {
    let document = DocumentRef::parse(document)?;
    let config = load_config(state_dir, &RunArgs::default())?;
    let store = EpochRecoveryStore::open(&config.ledger_path(), config.cache_path())?;
    let removed = store.manual_reset(&document.to_string()).await?;
    println!("removed {removed} cached updates for {document}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir.clone());
    let command = cli
        .command
        .take()
        .unwrap_or_else(|| Command::Run(RunArgs::default()));
    let to_stdout = matches!(command, Command::Run(_));
    let _log_guard = init_logging(&log_config(&cli, to_stdout));
    match command {
        Command::Run(args) => run(state_dir, args).await,
        Command::Status => status(state_dir).await,
        Command::ResetCache { document } => reset_cache(state_dir, &document).await,
    }
}
