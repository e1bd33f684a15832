//! Transports feed one event channel per orchestrator. Each transport runs in
//! its own task; the orchestrator talks to it through a `Transport` handle.

use serde_json::Value;
use std::{
    fmt, io,
    sync::{Arc, Mutex},
    time::Duration,
};
use tandem_core::{relay_wire::FrameError, DocUpdate};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub mod peer;
pub mod relay;

pub type TransportId = u64;

const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Relay,
    Peer,
    LocalCache,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Relay => "relay",
            TransportKind::Peer => "peer",
            TransportKind::LocalCache => "local-cache",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-transport status row, owned by the orchestrator's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaConnection {
    pub kind: TransportKind,
    pub endpoint: Option<String>,
    pub connected: bool,
    pub document_synced: bool,
}

impl ReplicaConnection {
    pub fn new(kind: TransportKind, endpoint: Option<String>) -> Self {
        Self {
            kind,
            endpoint,
            connected: false,
            document_synced: false,
        }
    }
}

/// Transition reported by a transport task, applied in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected {
        id: TransportId,
    },
    Disconnected {
        id: TransportId,
        reason: String,
    },
    Synced {
        id: TransportId,
    },
    Updates {
        id: TransportId,
        updates: Vec<DocUpdate>,
    },
    Presence {
        id: TransportId,
        sender: String,
        state: Value,
    },
    EpochRejected {
        id: TransportId,
        required_epoch: u32,
    },
}

impl TransportEvent {
    pub fn transport_id(&self) -> TransportId {
        match self {
            TransportEvent::Connected { id }
            | TransportEvent::Disconnected { id, .. }
            | TransportEvent::Synced { id }
            | TransportEvent::Updates { id, .. }
            | TransportEvent::Presence { id, .. }
            | TransportEvent::EpochRejected { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Updates(Vec<DocUpdate>),
    Presence { sender: String, state: Value },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no transport available")]
    TransportUnavailable,
    #[error("transport closed")]
    Closed,
    #[error("transport outbound queue full")]
    QueueFull,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn endpoint(&self) -> Option<String>;
    /// Identifier this side goes by on the transport, once known.
    fn local_transport_id(&self) -> Option<String>;
    fn send(&self, frame: Outbound) -> Result<(), TransportError>;
    fn close(&self);
}

/// Plumbing shared by transport handles: the outbound queue into the task,
/// its close signal, and the local id the task learns.
pub(crate) struct TransportLink {
    outbound: mpsc::Sender<Outbound>,
    close: watch::Sender<bool>,
    local_id: Arc<Mutex<Option<String>>>,
}

pub(crate) struct TaskSide {
    pub outbound: mpsc::Receiver<Outbound>,
    pub close: watch::Receiver<bool>,
    pub local_id: Arc<Mutex<Option<String>>>,
}

impl TransportLink {
    pub(crate) fn new(local_id: Option<String>) -> (Self, TaskSide) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let local_id = Arc::new(Mutex::new(local_id));
        (
            Self {
                outbound: outbound_tx,
                close: close_tx,
                local_id: local_id.clone(),
            },
            TaskSide {
                outbound: outbound_rx,
                close: close_rx,
                local_id,
            },
        )
    }

    pub(crate) fn local_id(&self) -> Option<String> {
        self.local_id.lock().ok().and_then(|id| id.clone())
    }

    pub(crate) fn send(&self, frame: Outbound) -> Result<(), TransportError> {
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    pub(crate) fn close(&self) {
        let _ = self.close.send(true);
    }
}

pub(crate) fn set_local_id(slot: &Arc<Mutex<Option<String>>>, value: Option<String>) {
    if let Ok(mut id) = slot.lock() {
        *id = value;
    }
}

/// Emits an event unless the orchestrator is gone. Returns false once the
/// receiving side has shut down.
pub(crate) async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> bool {
    events.send(event).await.is_ok()
}

/// Resolves once `flag` is set or its sender is gone. The read guard from
/// `wait_for` is dropped here so callers can race this inside `select!`.
pub(crate) async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let max = Duration::from_secs(10);
        assert_eq!(next_backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(8), max), max);
        assert_eq!(next_backoff(max, max), max);
    }

    #[test]
    fn link_reports_closed_queue() {
        let (link, side) = TransportLink::new(Some("peer-1".to_string()));
        assert_eq!(link.local_id().as_deref(), Some("peer-1"));
        set_local_id(&side.local_id, Some("conn-9".to_string()));
        assert_eq!(link.local_id().as_deref(), Some("conn-9"));
        drop(side);
        assert!(matches!(
            link.send(Outbound::Updates(Vec::new())),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn signalled_stops_a_spawned_select_loop() {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticks = 0u32;
            loop {
                tokio::select! {
                    _ = signalled(&mut rx) => return ticks,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        ticks += 1;
                        tokio::task::yield_now().await;
                    }
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).expect("send");
        let ticks = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("task stops")
            .expect("join");
        assert!(ticks >= 1);
    }

    #[test]
    fn kinds_render_as_wire_names() {
        assert_eq!(TransportKind::LocalCache.to_string(), "local-cache");
        assert_eq!(TransportKind::Relay.as_str(), "relay");
    }
}
