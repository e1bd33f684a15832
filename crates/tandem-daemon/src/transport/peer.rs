//! Direct UDP link between participant daemons. Every datagram is one JSON
//! `PeerFrame`; rooms are derived from the document identity so peers holding
//! a different epoch never exchange updates.

use super::{
    emit, signalled, Outbound, TaskSide, Transport, TransportError, TransportEvent, TransportId,
    TransportKind, TransportLink,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeSet,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tandem_core::{DocUpdate, DocumentIdentity, ReplicaDoc};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, RwLock},
};
use tracing::{debug, info, warn};

pub const MAX_DATAGRAM_BYTES: usize = 60 * 1024;
const FRAME_OVERHEAD_BYTES: usize = 512;

pub fn room_name(identity: &DocumentIdentity) -> String {
    format!("tandem:{identity}")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerFrame {
    pub room: String,
    pub sender: String,
    pub msg: PeerMsg,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMsg {
    Hello,
    Snapshot { updates: Vec<DocUpdate> },
    Update { updates: Vec<DocUpdate> },
    Presence { sender: String, state: Value },
}

#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub bind: SocketAddr,
    pub peers: Vec<SocketAddr>,
    pub max_datagram_bytes: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            peers: Vec::new(),
            max_datagram_bytes: MAX_DATAGRAM_BYTES,
        }
    }
}

pub struct PeerTransport {
    local_addr: SocketAddr,
    link: TransportLink,
}

impl PeerTransport {
    /// Binds the socket and starts the peer task. The transport reports
    /// itself connected as soon as the socket is bound.
    pub async fn bind(
        id: TransportId,
        identity: &DocumentIdentity,
        config: PeerConfig,
        doc: Arc<RwLock<ReplicaDoc>>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.bind).await?;
        let local_addr = socket.local_addr()?;
        let room = room_name(identity);
        let peer_id = format!("peer-{}", uuid::Uuid::new_v4());
        info!(
            event = "peer_bound",
            room = %room,
            addr = %local_addr,
            peer_id = %peer_id,
            peers = config.peers.len()
        );
        let (link, side) = TransportLink::new(Some(peer_id.clone()));
        let state = PeerState {
            id,
            socket,
            room,
            peer_id,
            peers: config.peers.iter().copied().collect(),
            max_datagram_bytes: config.max_datagram_bytes,
            doc,
            events,
        };
        tokio::spawn(run_peer(state, side));
        Ok(Self {
            local_addr,
            link,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for PeerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Peer
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.local_addr.to_string())
    }

    fn local_transport_id(&self) -> Option<String> {
        self.link.local_id()
    }

    fn send(&self, frame: Outbound) -> Result<(), TransportError> {
        self.link.send(frame)
    }

    fn close(&self) {
        self.link.close();
    }
}

struct PeerState {
    id: TransportId,
    socket: UdpSocket,
    room: String,
    peer_id: String,
    peers: BTreeSet<SocketAddr>,
    max_datagram_bytes: usize,
    doc: Arc<RwLock<ReplicaDoc>>,
    events: mpsc::Sender<TransportEvent>,
}

impl PeerState {
    fn frame(&self, msg: PeerMsg) -> PeerFrame {
        PeerFrame {
            room: self.room.clone(),
            sender: self.peer_id.clone(),
            msg,
        }
    }

    async fn send_to(&self, targets: &[SocketAddr], msg: PeerMsg) {
        let bytes = match serde_json::to_vec(&self.frame(msg)) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(event = "peer_encode_error", error = %err);
                return;
            }
        };
        if bytes.len() > self.max_datagram_bytes {
            warn!(event = "peer_frame_dropped", bytes = bytes.len());
            return;
        }
        for target in targets {
            if let Err(err) = self.socket.send_to(&bytes, target).await {
                debug!(event = "peer_send_error", target = %target, error = %err);
            }
        }
    }

    async fn send_updates(&self, targets: &[SocketAddr], updates: Vec<DocUpdate>, snapshot: bool) {
        for batch in batches(updates, self.max_datagram_bytes, snapshot) {
            let msg = if snapshot {
                PeerMsg::Snapshot { updates: batch }
            } else {
                PeerMsg::Update { updates: batch }
            };
            self.send_to(targets, msg).await;
        }
    }

    fn known_peers(&self) -> Vec<SocketAddr> {
        self.peers.iter().copied().collect()
    }
}

/// Splits updates into groups that fit one datagram. Snapshots always yield
/// at least one (possibly empty) group so the receiver can mark itself synced.
fn batches(updates: Vec<DocUpdate>, max_datagram_bytes: usize, keep_empty: bool) -> Vec<Vec<DocUpdate>> {
    let budget = max_datagram_bytes.saturating_sub(FRAME_OVERHEAD_BYTES);
    let mut out = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for update in updates {
        let size = serde_json::to_vec(&update).map(|bytes| bytes.len() + 1).unwrap_or(usize::MAX);
        if size > budget {
            warn!(event = "peer_update_too_large", id = %update.id, bytes = size);
            continue;
        }
        if used + size > budget && !current.is_empty() {
            out.push(std::mem::take(&mut current));
            used = 0;
        }
        used += size;
        current.push(update);
    }
    if !current.is_empty() || (out.is_empty() && keep_empty) {
        out.push(current);
    }
    out
}

async fn run_peer(mut state: PeerState, mut side: TaskSide) {
    let id = state.id;
    if !emit(&state.events, TransportEvent::Connected { id }).await {
        return;
    }
    let greeting = state.known_peers();
    state.send_to(&greeting, PeerMsg::Hello).await;

    let mut synced = false;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = signalled(&mut side.close) => break,
            frame = side.outbound.recv() => {
                let Some(frame) = frame else { break };
                let targets = state.known_peers();
                match frame {
                    Outbound::Updates(updates) => state.send_updates(&targets, updates, false).await,
                    Outbound::Presence { sender, state: presence } => {
                        state.send_to(&targets, PeerMsg::Presence { sender, state: presence }).await
                    }
                }
            }
            received = state.socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        debug!(event = "peer_recv_error", error = %err);
                        continue;
                    }
                };
                let frame: PeerFrame = match serde_json::from_slice(&buf[..len]) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(event = "peer_frame_invalid", from = %from, error = %err);
                        continue;
                    }
                };
                if frame.room != state.room || frame.sender == state.peer_id {
                    continue;
                }
                if state.peers.insert(from) {
                    debug!(event = "peer_learned", from = %from, sender = %frame.sender);
                }
                let delivered = match frame.msg {
                    PeerMsg::Hello => {
                        let snapshot = state.doc.read().await.updates();
                        state.send_updates(&[from], snapshot, true).await;
                        true
                    }
                    PeerMsg::Snapshot { updates } => {
                        let mut ok = true;
                        if !updates.is_empty() {
                            ok = emit(&state.events, TransportEvent::Updates { id, updates }).await;
                        }
                        if ok && !synced {
                            synced = true;
                            ok = emit(&state.events, TransportEvent::Synced { id }).await;
                        }
                        ok
                    }
                    PeerMsg::Update { updates } => {
                        emit(&state.events, TransportEvent::Updates { id, updates }).await
                    }
                    PeerMsg::Presence { sender, state: presence } => {
                        emit(
                            &state.events,
                            TransportEvent::Presence { id, sender, state: presence },
                        )
                        .await
                    }
                };
                if !delivered {
                    return;
                }
            }
        }
    }
    let _ = emit(
        &state.events,
        TransportEvent::Disconnected {
            id,
            reason: "closed".to_string(),
        },
    )
    .await;
    info!(event = "peer_closed", room = %state.room);
}
