//! Relay hub: one room per document identity, shared over WebSocket, with
//! the server half of the epoch gate and the machine-local relay registry.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tandem_core::{
    relay_wire::{
        decode_envelope, encode_text, ErrorPayload, RelayEnvelope, RelayMsg,
        SnapshotPayload, UpdatePayload, WelcomePayload, DEFAULT_MAX_FRAME_BYTES,
    },
    DocUpdate, DocumentIdentity, EpochRejection, RelayRegistryEntry, ReplicaDoc, DEFAULT_EPOCH,
    REGISTRY_PATH,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex as AsyncMutex, RwLock},
};
use tracing::{debug, info, warn};

pub mod registry;

use registry::{live_entries, RelayRegistration};

pub const NORMAL_CLOSE_CODE: u16 = 1000;
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;
pub const POLICY_CLOSE_CODE: u16 = 1008;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Lowest epoch admitted for namespaces without an override.
    pub min_epoch: u32,
    pub namespace_min_epochs: HashMap<String, u32>,
    /// Where this relay registers itself; `None` disables registration.
    pub registry_dir: Option<PathBuf>,
    pub stale_seconds: u64,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub debug: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_epoch: DEFAULT_EPOCH,
            namespace_min_epochs: HashMap::new(),
            registry_dir: None,
            stale_seconds: 30,
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: false,
        }
    }
}

impl RelayConfig {
    pub fn required_epoch(&self, namespace: &str) -> u32 {
        self.namespace_min_epochs
            .get(namespace)
            .copied()
            .unwrap_or(self.min_epoch)
    }

    /// The rejection to send for `identity`, if its epoch is below the minimum.
    pub fn check_epoch(&self, identity: &DocumentIdentity) -> Option<EpochRejection> {
        let required = self.required_epoch(identity.namespace());
        if identity.epoch() < required {
            return Some(EpochRejection::new(required));
        }
        None
    }
}

struct Member {
    conn_id: String,
    document: String,
    sender: mpsc::Sender<Message>,
    last_seen: Arc<AsyncMutex<Instant>>,
}

impl Member {
    async fn touch(&self) {
        let mut last = self.last_seen.lock().await;
        *last = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        let last = self.last_seen.lock().await;
        *last
    }

    async fn send_text(&self, text: String) -> bool {
        self.sender.send(Message::Text(text)).await.is_ok()
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

#[derive(Default)]
struct Room {
    doc: ReplicaDoc,
    members: HashMap<String, Arc<Member>>,
}

struct RelayHub {
    config: RelayConfig,
    self_entry: RelayRegistryEntry,
    shutdown: watch::Receiver<bool>,
    conn_counter: AtomicU64,
    members: RwLock<HashMap<String, Arc<Member>>>,
    rooms: RwLock<HashMap<String, Room>>,
}

impl RelayHub {
    fn new(
        config: RelayConfig,
        self_entry: RelayRegistryEntry,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            self_entry,
            shutdown,
            conn_counter: AtomicU64::new(0),
            members: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Adds the member to its room and returns the room's current updates.
    async fn join(&self, member: Arc<Member>) -> Vec<DocUpdate> {
        self.members
            .write()
            .await
            .insert(member.conn_id.clone(), member.clone());
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(member.document.clone()).or_default();
        room.members.insert(member.conn_id.clone(), member.clone());
        info!(
            event = "member_joined",
            conn_id = %member.conn_id,
            document = %member.document,
            members = room.members.len(),
            updates = room.doc.len()
        );
        room.doc.updates()
    }

    async fn remove_member(&self, member: &Member, code: u16, reason: &str) {
        member.close(code, reason).await;
        let removed = self.members.write().await.remove(&member.conn_id).is_some();
        if let Some(room) = self.rooms.write().await.get_mut(&member.document) {
            room.members.remove(&member.conn_id);
        }
        if removed {
            info!(
                event = "member_left",
                conn_id = %member.conn_id,
                document = %member.document,
                reason = reason
            );
        }
    }

    async fn room_peers(&self, member: &Member) -> Vec<Arc<Member>> {
        self.rooms
            .read()
            .await
            .get(&member.document)
            .map(|room| {
                room.members
                    .values()
                    .filter(|peer| peer.conn_id != member.conn_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Merges updates into the member's room; returns the ones the room had
    /// not seen and the other members they must reach.
    async fn merge_into_room(
        &self,
        member: &Member,
        updates: Vec<DocUpdate>,
    ) -> (Vec<DocUpdate>, Vec<Arc<Member>>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(member.document.clone()).or_default();
        let fresh = room.doc.merge(updates);
        let peers = room
            .members
            .values()
            .filter(|peer| peer.conn_id != member.conn_id)
            .cloned()
            .collect();
        (fresh, peers)
    }

    fn encode(&self, envelope: &RelayEnvelope) -> Option<String> {
        match encode_text(envelope, self.config.max_frame_bytes) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(event = "frame_encode_failed", error = %err);
                None
            }
        }
    }

    async fn send_to(&self, targets: &[Arc<Member>], envelope: &RelayEnvelope) {
        let Some(text) = self.encode(envelope) else {
            return;
        };
        for target in targets {
            if !target.send_text(text.clone()).await {
                warn!(event = "send_error", conn_id = %target.conn_id);
                self.remove_member(target, POLICY_CLOSE_CODE, "send_error")
                    .await;
            }
        }
    }

    async fn send_error(&self, member: &Member, code: &str, message: &str) {
        let envelope = RelayEnvelope::new(RelayMsg::Error(ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        }));
        if let Some(text) = self.encode(&envelope) {
            let _ = member.send_text(text).await;
        }
    }

    async fn handle_frame(&self, member: &Member, data: &[u8]) {
        let envelope = match decode_envelope(data) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %member.conn_id, error = %err);
                self.send_error(member, "invalid_message", &err.to_string())
                    .await;
                return;
            }
        };
        match envelope.msg {
            RelayMsg::Update(UpdatePayload { updates })
            | RelayMsg::Snapshot(SnapshotPayload { updates }) => {
                let received = updates.len();
                let (fresh, peers) = self.merge_into_room(member, updates).await;
                debug!(
                    event = "room_merge",
                    conn_id = %member.conn_id,
                    document = %member.document,
                    received = received,
                    fresh = fresh.len()
                );
                if fresh.is_empty() || peers.is_empty() {
                    return;
                }
                let envelope = RelayEnvelope::new(RelayMsg::Update(UpdatePayload {
                    updates: fresh,
                }));
                self.send_to(&peers, &envelope).await;
            }
            RelayMsg::Presence(payload) => {
                let peers = self.room_peers(member).await;
                if peers.is_empty() {
                    return;
                }
                let envelope = RelayEnvelope::new(RelayMsg::Presence(payload));
                self.send_to(&peers, &envelope).await;
            }
            RelayMsg::Welcome(_) | RelayMsg::Error(_) => {
                warn!(event = "unexpected_message", conn_id = %member.conn_id);
                self.send_error(member, "unexpected_message", "relay-only message type")
                    .await;
            }
        }
    }

    fn start_stale_reaper(self: Arc<Self>) {
        if self.config.stale_seconds == 0 {
            return;
        }
        let stale_after = Duration::from_secs(self.config.stale_seconds);
        let interval = stale_after / 2;
        let hub = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => return,
                    _ = ticker.tick() => {}
                }
                let members = hub
                    .members
                    .read()
                    .await
                    .values()
                    .cloned()
                    .collect::<Vec<_>>();
                for member in members {
                    let last_seen = member.last_seen().await;
                    if Instant::now().duration_since(last_seen) > stale_after {
                        warn!(event = "stale_close", conn_id = %member.conn_id);
                        hub.remove_member(&member, POLICY_CLOSE_CODE, "stale").await;
                    }
                }
            }
        });
    }

    fn start_ping(self: Arc<Self>, member: Arc<Member>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !hub.members.read().await.contains_key(&member.conn_id) {
                    return;
                }
                if member.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(event = "ping_failed", conn_id = %member.conn_id);
                    hub.remove_member(&member, POLICY_CLOSE_CODE, "ping_failed")
                        .await;
                    return;
                }
            }
        });
    }

    async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        identity: DocumentIdentity,
        remote: SocketAddr,
    ) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) if !closing => {}
                    _ => return,
                }
            }
        });

        let member = Arc::new(Member {
            conn_id: self.next_conn_id(),
            document: identity.to_string(),
            sender: tx.clone(),
            last_seen: Arc::new(AsyncMutex::new(Instant::now())),
        });
        debug!(event = "handshake_ok", conn_id = %member.conn_id, remote = %remote);
        let snapshot = self.join(member.clone()).await;

        let welcome = RelayEnvelope::new(RelayMsg::Welcome(WelcomePayload {
            conn_id: member.conn_id.clone(),
            document: member.document.clone(),
        }));
        let snapshot = RelayEnvelope::new(RelayMsg::Snapshot(SnapshotPayload { updates: snapshot }));
        for envelope in [welcome, snapshot] {
            let sent = match self.encode(&envelope) {
                Some(text) => member.send_text(text).await,
                None => false,
            };
            if !sent {
                warn!(event = "snapshot_error", conn_id = %member.conn_id);
                self.remove_member(&member, POLICY_CLOSE_CODE, "snapshot_error")
                    .await;
                drop(tx);
                let _ = write_task.await;
                return;
            }
        }
        self.clone().start_ping(member.clone());

        let mut shutdown = self.shutdown.clone();
        let mut close = (NORMAL_CLOSE_CODE, "disconnect");
        loop {
            let next = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    close = (GOING_AWAY_CLOSE_CODE, "relay_shutdown");
                    break;
                }
                next = ws_receiver.next() => next,
            };
            let msg = match next {
                Some(Ok(value)) => value,
                Some(Err(err)) => {
                    warn!(event = "read_error", conn_id = %member.conn_id, error = %err);
                    break;
                }
                None => break,
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %member.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    member.touch().await;
                    continue;
                }
            };
            member.touch().await;
            if data.len() > self.config.max_frame_bytes {
                warn!(event = "message_too_large", conn_id = %member.conn_id, size = data.len());
                continue;
            }
            if self.config.debug {
                debug!(event = "message_received", conn_id = %member.conn_id, raw = %String::from_utf8_lossy(&data));
            }
            self.handle_frame(&member, &data).await;
        }

        self.remove_member(&member, close.0, close.1).await;
        drop(tx);
        let _ = write_task.await;
    }

    async fn registry_entries(&self) -> Vec<RelayRegistryEntry> {
        let dir = self.config.registry_dir.clone();
        let own = self.self_entry.clone();
        tokio::task::spawn_blocking(move || {
            let mut entries = dir.map(|dir| live_entries(&dir)).unwrap_or_default();
            if !entries.iter().any(|entry| entry.port == own.port) {
                entries.push(own);
                entries.sort_by_key(|entry| entry.port);
            }
            entries
        })
        .await
        .unwrap_or_default()
    }
}

async fn reject_socket(mut socket: WebSocket, code: u16, reason: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(document): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<RelayHub>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let Some(identity) = DocumentIdentity::parse(&document) else {
            warn!(event = "invalid_document", document = %document, remote = %addr);
            reject_socket(socket, POLICY_CLOSE_CODE, "invalid_document".to_string()).await;
            return;
        };
        if let Some(rejection) = hub.config.check_epoch(&identity) {
            info!(
                event = "epoch_rejected",
                document = %identity,
                required_epoch = rejection.required_epoch,
                remote = %addr
            );
            reject_socket(socket, rejection.code(), rejection.reason()).await;
            return;
        }
        hub.handle_socket(socket, identity, addr).await;
    })
}

async fn registry_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<RelayHub>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    Json(hub.registry_entries().await).into_response()
}

fn router(hub: Arc<RelayHub>) -> Router {
    Router::new()
        .route("/ws/:doc", get(ws_handler))
        .route(REGISTRY_PATH, get(registry_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

/// Runs the relay on `listener` until `shutdown` flips to true. While
/// running, the relay is registered under `config.registry_dir`.
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    let self_entry = RelayRegistryEntry {
        port: addr.port(),
        pid: std::process::id(),
        url: format!("ws://{addr}"),
        registered_at: Utc::now().to_rfc3339(),
    };
    let registration = match &config.registry_dir {
        Some(dir) => match RelayRegistration::register(dir, self_entry.clone()) {
            Ok(registration) => {
                info!(event = "relay_registered", path = %registration.path().display());
                Some(registration)
            }
            Err(err) => {
                warn!(event = "relay_register_failed", dir = %dir.display(), error = %err);
                None
            }
        },
        None => None,
    };

    let min_epoch = config.min_epoch;
    let hub = Arc::new(RelayHub::new(config, self_entry, shutdown.clone()));
    hub.clone().start_stale_reaper();
    let app = router(hub);

    info!(event = "relay_start", addr = %addr, min_epoch = min_epoch);
    let mut signal = shutdown;
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = signal.wait_for(|stop| *stop).await;
    })
    .await;

    drop(registration);
    info!(event = "relay_stop", addr = %addr);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_override_beats_global_minimum() {
        let mut config = RelayConfig {
            min_epoch: 2,
            ..RelayConfig::default()
        };
        config.namespace_min_epochs.insert("plan".to_string(), 5);
        assert_eq!(config.required_epoch("task"), 2);
        assert_eq!(config.required_epoch("plan"), 5);
    }

    #[test]
    fn epoch_check_rejects_only_older_epochs() {
        let config = RelayConfig::default();
        let old = DocumentIdentity::build("task", "t1", 1).expect("identity");
        let current = old.with_epoch(DEFAULT_EPOCH).expect("identity");
        let newer = old.with_epoch(DEFAULT_EPOCH + 3).expect("identity");

        let rejection = config.check_epoch(&old).expect("rejected");
        assert_eq!(rejection.required_epoch, DEFAULT_EPOCH);
        assert_eq!(rejection.reason(), format!("epoch_too_old:{DEFAULT_EPOCH}"));
        assert!(config.check_epoch(&current).is_none());
        assert!(config.check_epoch(&newer).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rooms_merge_and_report_fresh_updates_only() {
        let (_tx, rx) = watch::channel(false);
        let entry = RelayRegistryEntry {
            port: 1,
            pid: 1,
            url: "ws://127.0.0.1:1".to_string(),
            registered_at: String::new(),
        };
        let hub = RelayHub::new(RelayConfig::default(), entry, rx);
        let (sender_a, _rx_a) = mpsc::channel(8);
        let (sender_b, _rx_b) = mpsc::channel(8);
        let a = Arc::new(Member {
            conn_id: hub.next_conn_id(),
            document: "task:t1:2".to_string(),
            sender: sender_a,
            last_seen: Arc::new(AsyncMutex::new(Instant::now())),
        });
        let b = Arc::new(Member {
            conn_id: hub.next_conn_id(),
            document: "task:t1:2".to_string(),
            sender: sender_b,
            last_seen: Arc::new(AsyncMutex::new(Instant::now())),
        });
        assert!(hub.join(a.clone()).await.is_empty());
        assert!(hub.join(b.clone()).await.is_empty());

        let update = DocUpdate::message("a", tandem_core::Role::User, "hi");
        let (fresh, peers) = hub.merge_into_room(&a, vec![update.clone()]).await;
        assert_eq!(fresh, vec![update.clone()]);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].conn_id, b.conn_id);

        let (fresh, _) = hub.merge_into_room(&b, vec![update]).await;
        assert!(fresh.is_empty());

        hub.remove_member(&a, NORMAL_CLOSE_CODE, "disconnect").await;
        assert!(hub.room_peers(&b).await.is_empty());
    }
}
