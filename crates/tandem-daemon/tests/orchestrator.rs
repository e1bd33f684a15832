use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, path::Path, time::Duration};
use tandem_core::{
    relay_wire::{decode_envelope, encode_text, RelayEnvelope, RelayMsg, UpdatePayload, DEFAULT_MAX_FRAME_BYTES},
    DocUpdate, DocumentIdentity, Role,
};
use tandem_daemon::{
    discovery::DiscoveryConfig,
    transport::relay::RelayTransportConfig,
    AggregateSyncState, EpochRecoveryStore, HandleEvent, OrchestratorConfig, RecoveryOutcome,
    ReplicaHandle, ReplicaOrchestrator, TransportKind,
};
use tandem_relay::{serve, RelayConfig};
use tandem_storage::ReplicaCache;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct RunningRelay {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningRelay {
    async fn start(config: RelayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, config, rx));
        Self {
            addr,
            shutdown,
            task,
        }
    }

    fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

fn config_for(dir: &Path, relay: &RunningRelay) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(dir.join("replicas.sqlite3"));
    config.discovery.ports = Vec::new();
    config.static_relays = vec![relay.base_url()];
    config.relay = RelayTransportConfig {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(500),
        ..RelayTransportConfig::default()
    };
    config
}

async fn wait_for_state(
    handle: &ReplicaHandle,
    ready: impl FnMut(&AggregateSyncState) -> bool,
) -> AggregateSyncState {
    let mut status = handle.status();
    let state = tokio::time::timeout(Duration::from_secs(10), status.wait_for(ready))
        .await
        .expect("state reached in time")
        .expect("status open");
    *state
}

fn relay_synced(state: &AggregateSyncState) -> bool {
    state.all_transports_synced && state.active_transport_count >= 2
}

async fn next_event(handle: &mut ReplicaHandle) -> Option<HandleEvent> {
    tokio::time::timeout(Duration::from_secs(10), handle.next_event())
        .await
        .expect("event in time")
}

async fn join_room(url: &str) -> Socket {
    let (mut socket, _) = connect_async(url).await.expect("connect");
    for _ in 0..2 {
        let _ = tokio::time::timeout(Duration::from_secs(5), socket.next()).await;
    }
    socket
}

async fn next_update(socket: &mut Socket) -> Vec<DocUpdate> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("read");
        if let Message::Text(text) = msg {
            if let RelayMsg::Update(payload) = decode_envelope(text.as_bytes()).expect("envelope").msg {
                return payload.updates;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replica_syncs_with_a_live_relay() {
    let relay = RunningRelay::start(RelayConfig::default()).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let identity = DocumentIdentity::build("task", "t1", 2).expect("identity");

    let mut handle = ReplicaOrchestrator::start(identity.clone(), config_for(dir.path(), &relay))
        .await
        .expect("start");
    let state = wait_for_state(&handle, relay_synced).await;
    assert!(state.any_transport_connected);

    let rows = handle.connections().await;
    let relay_row = rows
        .iter()
        .find(|row| row.kind == TransportKind::Relay)
        .expect("relay row");
    assert!(relay_row.connected && relay_row.document_synced);
    assert!(matches!(handle.best_transport().await, Ok(TransportKind::Relay)));

    let room = format!("{}/ws/{identity}", relay.base_url());
    let mut remote = join_room(&room).await;

    let from_remote = DocUpdate::message("tab-remote", Role::User, "please fix the build");
    let text = encode_text(
        &RelayEnvelope::new(RelayMsg::Update(UpdatePayload {
            updates: vec![from_remote.clone()],
        })),
        DEFAULT_MAX_FRAME_BYTES,
    )
    .expect("encode");
    remote.send(Message::Text(text)).await.expect("send");

    assert_eq!(
        next_event(&mut handle).await,
        Some(HandleEvent::DocumentChanged {
            source: Some(TransportKind::Relay),
            fresh: 1
        })
    );
    assert!(handle.doc().read().await.contains(&from_remote.id));

    let local = DocUpdate::message("daemon", Role::Assistant, "on it");
    assert_eq!(handle.submit(vec![local.clone()]).await.expect("submit"), 1);
    assert_eq!(next_update(&mut remote).await, vec![local.clone()]);

    handle.shutdown().await;
    let cache = ReplicaCache::open(dir.path().join("replicas.sqlite3")).expect("cache");
    let stored = cache.load_updates(&identity).expect("load");
    assert_eq!(stored.len(), 2);
    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovered_relay_is_used() {
    let relay = RunningRelay::start(RelayConfig::default()).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let identity = DocumentIdentity::build("task", "t3", 2).expect("identity");

    let mut config = config_for(dir.path(), &relay);
    config.static_relays.clear();
    config.discovery = DiscoveryConfig {
        ports: vec![relay.addr.port()],
        host: "127.0.0.1".to_string(),
        probe_timeout: Duration::from_millis(500),
    };
    let handle = ReplicaOrchestrator::start(identity, config).await.expect("start");
    wait_for_state(&handle, relay_synced).await;
    let rows = handle.connections().await;
    let relay_row = rows
        .iter()
        .find(|row| row.kind == TransportKind::Relay)
        .expect("relay row");
    assert_eq!(
        relay_row.endpoint.as_deref(),
        Some(format!("ws://{}/ws/task:t3:2", relay.addr).as_str())
    );
    handle.shutdown().await;
    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn epoch_rejection_tears_down_and_recovery_resyncs() {
    let relay = RunningRelay::start(RelayConfig {
        min_epoch: 5,
        ..RelayConfig::default()
    })
    .await;
    let dir = tempfile::tempdir().expect("tempdir");
    let cache_path = dir.path().join("replicas.sqlite3");
    let store = EpochRecoveryStore::open(&dir.path().join("epochs.sqlite3"), cache_path.clone())
        .expect("store");
    let identity = store.identity_for("task", "t2").await.expect("identity");
    assert_eq!(identity.epoch(), 2);

    let mut cache = ReplicaCache::open(&cache_path).expect("cache");
    cache
        .store_updates(&identity, &[DocUpdate::message("tab", Role::User, "stale draft")])
        .expect("seed");
    drop(cache);

    let mut handle = ReplicaOrchestrator::start(identity.clone(), config_for(dir.path(), &relay))
        .await
        .expect("start");

    let rejected = loop {
        match next_event(&mut handle).await {
            Some(HandleEvent::EpochRejected { required_epoch }) => break required_epoch,
            Some(_) => continue,
            None => panic!("handle closed without a rejection"),
        }
    };
    assert_eq!(rejected, 5);
    assert_eq!(next_event(&mut handle).await, None);
    assert!(handle.connections().await.is_empty());
    handle.shutdown().await;

    let outcome = store.handle_rejection(&identity, rejected).await.expect("recover");
    let RecoveryOutcome::Resync(next) = outcome else {
        panic!("expected resync, got {outcome:?}");
    };
    assert_eq!(next.epoch(), 5);
    assert_eq!(store.reset_attempts("task:t2").await.expect("attempts"), 0);
    let cache = ReplicaCache::open(&cache_path).expect("cache");
    assert!(cache.load_updates(&identity).expect("load").is_empty());
    drop(cache);

    let handle = ReplicaOrchestrator::start(next, config_for(dir.path(), &relay))
        .await
        .expect("restart");
    wait_for_state(&handle, relay_synced).await;
    assert!(handle.doc().read().await.is_empty());
    handle.shutdown().await;
    relay.stop().await;
}
