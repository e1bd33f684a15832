//! One replica of one document: the durable local cache, a relay link per
//! discovered relay, and a single peer link, folded into one sync status.

use crate::{
    discovery::{DiscoveryConfig, RelayDiscovery},
    transport::{
        peer::{PeerConfig, PeerTransport},
        relay::{RelayTransport, RelayTransportConfig},
        signalled, Outbound, ReplicaConnection, Transport, TransportError, TransportEvent, TransportId,
        TransportKind,
    },
};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tandem_core::{room_url, DocUpdate, DocumentIdentity, RelayRegistryEntry, ReplicaDoc};
use tandem_storage::{ReplicaCache, StorageError};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("replica cache error: {0}")]
    Cache(#[from] StorageError),
    #[error("replica task failed: {0}")]
    Task(String),
    #[error("replica handle is closed")]
    Closed,
}

/// Status derived from the relay and peer rows. The local cache row never
/// counts towards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateSyncState {
    pub any_transport_connected: bool,
    /// True when every open relay transport reports synced, including when
    /// there are none.
    pub all_transports_synced: bool,
    pub active_transport_count: usize,
}

impl AggregateSyncState {
    pub fn from_connections<'a>(rows: impl IntoIterator<Item = &'a ReplicaConnection>) -> Self {
        let mut any_transport_connected = false;
        let mut all_transports_synced = true;
        let mut active_transport_count = 0;
        for row in rows {
            match row.kind {
                TransportKind::LocalCache => continue,
                TransportKind::Relay => {
                    if !row.document_synced {
                        all_transports_synced = false;
                    }
                }
                TransportKind::Peer => {}
            }
            if row.connected {
                any_transport_connected = true;
                active_transport_count += 1;
            }
        }
        Self {
            any_transport_connected,
            all_transports_synced,
            active_transport_count,
        }
    }

    pub fn is_offline(&self) -> bool {
        !self.any_transport_connected
    }
}

impl Default for AggregateSyncState {
    fn default() -> Self {
        Self::from_connections(std::iter::empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandleEvent {
    /// New updates were merged. `source` is `None` for local submissions.
    DocumentChanged {
        source: Option<TransportKind>,
        fresh: usize,
    },
    Presence {
        sender: String,
        state: Value,
    },
    /// A transport reported a stale epoch; the handle has torn itself down.
    EpochRejected {
        required_epoch: u32,
    },
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub cache_path: PathBuf,
    pub discovery: DiscoveryConfig,
    /// Relay base URLs (`ws://host:port`) used in addition to discovery.
    pub static_relays: Vec<String>,
    pub relay: RelayTransportConfig,
    pub peer: PeerConfig,
}

impl OrchestratorConfig {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            discovery: DiscoveryConfig::default(),
            static_relays: Vec::new(),
            relay: RelayTransportConfig::default(),
            peer: PeerConfig::default(),
        }
    }
}

enum Command {
    Connections(oneshot::Sender<Vec<ReplicaConnection>>),
    BestTransport(oneshot::Sender<Result<TransportKind, TransportError>>),
    Presence {
        sender: String,
        state: Value,
        reply: oneshot::Sender<Result<TransportKind, TransportError>>,
    },
    Submit {
        updates: Vec<DocUpdate>,
        reply: oneshot::Sender<Result<usize, OrchestratorError>>,
    },
}

pub struct ReplicaOrchestrator;

impl ReplicaOrchestrator {
    /// Opens the local cache, then brings up transports in the background.
    /// Only a cache failure is an error; missing relays or peers just leave
    /// the replica offline.
    pub async fn start(
        identity: DocumentIdentity,
        config: OrchestratorConfig,
    ) -> Result<ReplicaHandle, OrchestratorError> {
        let cache_path = config.cache_path.clone();
        let open_identity = identity.clone();
        let (cache, loaded) = tokio::task::spawn_blocking(move || {
            let cache = ReplicaCache::open(&cache_path)?;
            let loaded = cache.open_document(&open_identity)?;
            Ok::<_, StorageError>((cache, loaded))
        })
        .await
        .map_err(|err| OrchestratorError::Task(err.to_string()))??;
        info!(
            event = "replica_open",
            document = %identity,
            cached_updates = loaded.len()
        );

        let doc = Arc::new(RwLock::new(ReplicaDoc::from_updates(loaded)));
        let (status_tx, status_rx) = watch::channel(AggregateSyncState::default());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (transport_tx, transport_rx) = mpsc::channel(EVENT_CAPACITY);

        let cache_row = ReplicaConnection {
            kind: TransportKind::LocalCache,
            endpoint: Some(config.cache_path.display().to_string()),
            connected: true,
            document_synced: true,
        };
        let event_loop = EventLoop {
            identity: identity.clone(),
            doc: doc.clone(),
            cache: Some(Arc::new(Mutex::new(cache))),
            cache_row,
            slots: BTreeMap::new(),
            endpoints: BTreeSet::new(),
            next_id: 1,
            relay_config: config.relay.clone(),
            status_tx,
            events_tx,
            transport_tx,
        };
        let task = tokio::spawn(event_loop.run(config, commands_rx, transport_rx, shutdown_rx));

        Ok(ReplicaHandle {
            identity,
            doc,
            status: status_rx,
            events: events_rx,
            commands: commands_tx,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }
}

/// Live replica. Dropping the handle tears everything down.
pub struct ReplicaHandle {
    identity: DocumentIdentity,
    doc: Arc<RwLock<ReplicaDoc>>,
    status: watch::Receiver<AggregateSyncState>,
    events: mpsc::Receiver<HandleEvent>,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReplicaHandle {
    pub fn identity(&self) -> &DocumentIdentity {
        &self.identity
    }

    pub fn doc(&self) -> Arc<RwLock<ReplicaDoc>> {
        self.doc.clone()
    }

    pub fn status(&self) -> watch::Receiver<AggregateSyncState> {
        self.status.clone()
    }

    /// Next document change, presence or rejection. `None` once torn down.
    pub async fn next_event(&mut self) -> Option<HandleEvent> {
        self.events.recv().await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Every transport row, local cache first.
    pub async fn connections(&self) -> Vec<ReplicaConnection> {
        self.request(Command::Connections).await.unwrap_or_default()
    }

    pub async fn best_transport(&self) -> Result<TransportKind, TransportError> {
        self.request(Command::BestTransport)
            .await
            .unwrap_or(Err(TransportError::TransportUnavailable))
    }

    /// Sends ephemeral state over the best transport. Fails rather than
    /// dropping it when nothing is connected.
    pub async fn send_presence(
        &self,
        sender: impl Into<String>,
        state: Value,
    ) -> Result<TransportKind, TransportError> {
        let sender = sender.into();
        self.request(|reply| Command::Presence {
            sender,
            state,
            reply,
        })
        .await
        .unwrap_or(Err(TransportError::TransportUnavailable))
    }

    /// Merges local updates, persists them and forwards them to every
    /// transport. Returns how many were new.
    pub async fn submit(&self, updates: Vec<DocUpdate>) -> Result<usize, OrchestratorError> {
        self.request(|reply| Command::Submit { updates, reply })
            .await
            .unwrap_or(Err(OrchestratorError::Closed))
    }

    /// Closes every transport and the cache and waits for the loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!(event = "replica_shutdown_timeout", document = %self.identity);
            }
        }
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct Slot {
    transport: Box<dyn Transport>,
    row: ReplicaConnection,
}

struct EventLoop {
    identity: DocumentIdentity,
    doc: Arc<RwLock<ReplicaDoc>>,
    cache: Option<Arc<Mutex<ReplicaCache>>>,
    cache_row: ReplicaConnection,
    slots: BTreeMap<TransportId, Slot>,
    endpoints: BTreeSet<String>,
    next_id: TransportId,
    relay_config: RelayTransportConfig,
    status_tx: watch::Sender<AggregateSyncState>,
    events_tx: mpsc::Sender<HandleEvent>,
    transport_tx: mpsc::Sender<TransportEvent>,
}

impl EventLoop {
    async fn run(
        mut self,
        config: OrchestratorConfig,
        mut commands: mpsc::Receiver<Command>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let fresh = self.doc.read().await.len();
        if fresh > 0 {
            self.notify(HandleEvent::DocumentChanged {
                source: Some(TransportKind::LocalCache),
                fresh,
            });
        }

        let discovery = RelayDiscovery::new(config.discovery.clone());
        let mut discovery_task = tokio::spawn(async move { discovery.discover().await });
        let mut discovery_pending = true;

        for base in &config.static_relays {
            self.open_relay(room_url(base, &self.identity.to_string()));
        }
        self.open_peer(config.peer.clone()).await;

        loop {
            tokio::select! {
                _ = signalled(&mut shutdown) => break,
                discovered = &mut discovery_task, if discovery_pending => {
                    discovery_pending = false;
                    match discovered {
                        Ok(entries) => self.open_discovered(entries),
                        Err(err) => warn!(event = "discovery_task_failed", error = %err),
                    }
                }
                event = transport_rx.recv() => {
                    let Some(event) = event else { break };
                    if let Some(required_epoch) = self.apply(event).await {
                        if discovery_pending {
                            discovery_task.abort();
                        }
                        self.teardown();
                        let _ = self
                            .events_tx
                            .send(HandleEvent::EpochRejected { required_epoch })
                            .await;
                        return;
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
            }
        }
        if discovery_pending {
            discovery_task.abort();
        }
        self.teardown();
    }

    fn open_discovered(&mut self, entries: Vec<RelayRegistryEntry>) {
        if entries.is_empty() {
            info!(
                event = "relay_unavailable",
                document = %self.identity,
                "no local relay found; continuing with cache and peers"
            );
            return;
        }
        let document = self.identity.to_string();
        for entry in entries {
            self.open_relay(entry.room_url(&document));
        }
    }

    fn allocate_id(&mut self) -> TransportId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn open_relay(&mut self, url: String) {
        if !self.endpoints.insert(url.clone()) {
            debug!(event = "relay_duplicate", url = %url);
            return;
        }
        let id = self.allocate_id();
        let transport = RelayTransport::spawn(
            id,
            url.clone(),
            self.relay_config.clone(),
            self.doc.clone(),
            self.transport_tx.clone(),
        );
        info!(event = "relay_open", document = %self.identity, url = %url, transport = id);
        self.insert_slot(id, Box::new(transport));
    }

    async fn open_peer(&mut self, config: PeerConfig) {
        let id = self.allocate_id();
        match PeerTransport::bind(
            id,
            &self.identity,
            config,
            self.doc.clone(),
            self.transport_tx.clone(),
        )
        .await
        {
            Ok(transport) => self.insert_slot(id, Box::new(transport)),
            Err(err) => warn!(event = "peer_unavailable", document = %self.identity, error = %err),
        }
    }

    fn insert_slot(&mut self, id: TransportId, transport: Box<dyn Transport>) {
        let row = ReplicaConnection::new(transport.kind(), transport.endpoint());
        self.slots.insert(id, Slot { transport, row });
        self.recompute();
    }

    fn recompute(&self) {
        let next = AggregateSyncState::from_connections(self.slots.values().map(|slot| &slot.row));
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(
                event = "sync_state",
                document = %self.identity,
                connected = next.any_transport_connected,
                synced = next.all_transports_synced,
                active = next.active_transport_count
            );
        }
    }

    fn notify(&self, event: HandleEvent) {
        if let Err(err) = self.events_tx.try_send(event) {
            debug!(event = "handle_event_dropped", error = %err);
        }
    }

    /// Applies one transport transition. Returns the required epoch when the
    /// transport was rejected.
    async fn apply(&mut self, event: TransportEvent) -> Option<u32> {
        let id = event.transport_id();
        let Some(slot) = self.slots.get_mut(&id) else {
            return None;
        };
        let kind = slot.row.kind;
        match event {
            TransportEvent::Connected { .. } => {
                slot.row.connected = true;
                self.recompute();
            }
            TransportEvent::Disconnected { reason, .. } => {
                debug!(event = "transport_down", transport = id, kind = %kind, reason = %reason);
                slot.row.connected = false;
                slot.row.document_synced = false;
                self.recompute();
            }
            TransportEvent::Synced { .. } => {
                slot.row.document_synced = true;
                info!(
                    event = "transport_synced",
                    document = %self.identity,
                    transport = id,
                    kind = %kind,
                    local_id = ?slot.transport.local_transport_id()
                );
                self.recompute();
            }
            TransportEvent::Updates { updates, .. } => {
                let fresh = self.doc.write().await.merge(updates);
                if !fresh.is_empty() {
                    if let Err(err) = self.persist(&fresh).await {
                        warn!(event = "replica_persist_failed", document = %self.identity, error = %err);
                    }
                    self.forward(Some(id), &fresh);
                    self.notify(HandleEvent::DocumentChanged {
                        source: Some(kind),
                        fresh: fresh.len(),
                    });
                }
            }
            TransportEvent::Presence { sender, state, .. } => {
                self.notify(HandleEvent::Presence { sender, state });
            }
            TransportEvent::EpochRejected { required_epoch, .. } => {
                warn!(
                    event = "replica_epoch_rejected",
                    document = %self.identity,
                    transport = id,
                    required_epoch = required_epoch
                );
                return Some(required_epoch);
            }
        }
        None
    }

    async fn persist(&self, updates: &[DocUpdate]) -> Result<usize, OrchestratorError> {
        let Some(cache) = self.cache.clone() else {
            return Err(OrchestratorError::Closed);
        };
        let identity = self.identity.clone();
        let updates = updates.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut cache = cache
                .lock()
                .map_err(|_| OrchestratorError::Task("replica cache lock poisoned".to_string()))?;
            Ok(cache.store_updates(&identity, &updates)?)
        })
        .await
        .map_err(|err| OrchestratorError::Task(err.to_string()))?
    }

    fn forward(&self, except: Option<TransportId>, updates: &[DocUpdate]) {
        for (id, slot) in &self.slots {
            if Some(*id) == except {
                continue;
            }
            if let Err(err) = slot.transport.send(Outbound::Updates(updates.to_vec())) {
                debug!(event = "forward_failed", transport = id, kind = %slot.row.kind, error = %err);
            }
        }
    }

    fn best(&self) -> Option<&Slot> {
        let connected = |kind: TransportKind| {
            self.slots
                .values()
                .find(|slot| slot.row.kind == kind && slot.row.connected)
        };
        connected(TransportKind::Relay).or_else(|| connected(TransportKind::Peer))
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connections(reply) => {
                let mut rows = vec![self.cache_row.clone()];
                rows.extend(self.slots.values().map(|slot| slot.row.clone()));
                let _ = reply.send(rows);
            }
            Command::BestTransport(reply) => {
                let best = self
                    .best()
                    .map(|slot| slot.row.kind)
                    .ok_or(TransportError::TransportUnavailable);
                let _ = reply.send(best);
            }
            Command::Presence {
                sender,
                state,
                reply,
            } => {
                let result = match self.best() {
                    Some(slot) => slot
                        .transport
                        .send(Outbound::Presence { sender, state })
                        .map(|_| slot.row.kind),
                    None => Err(TransportError::TransportUnavailable),
                };
                let _ = reply.send(result);
            }
            Command::Submit { updates, reply } => {
                let fresh = self.doc.write().await.merge(updates);
                if fresh.is_empty() {
                    let _ = reply.send(Ok(0));
                    return;
                }
                let persisted = self.persist(&fresh).await;
                self.forward(None, &fresh);
                self.notify(HandleEvent::DocumentChanged {
                    source: None,
                    fresh: fresh.len(),
                });
                let _ = reply.send(persisted.map(|_| fresh.len()));
            }
        }
    }

    /// Closes every transport and the cache. Nothing here can fail the caller.
    fn teardown(&mut self) {
        for (_, slot) in std::mem::take(&mut self.slots) {
            slot.transport.close();
        }
        self.endpoints.clear();
        self.cache = None;
        self.recompute();
        info!(event = "replica_closed", document = %self.identity);
    }
}
