//! Per-machine replica daemon: singleton lock, epoch recovery, relay/peer
//! orchestration and agent dispatch.

pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod epoch;
pub mod follow;
pub mod lock;
pub mod orchestrator;
pub mod transport;

pub use config::{DaemonConfig, DocumentRef, FileConfig};
pub use discovery::{DiscoveryConfig, DiscoveryError, RelayDiscovery, PROBE_TIMEOUT};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use epoch::{EpochError, EpochRecoveryStore, RecoveryOutcome, MAX_RESET_ATTEMPTS};
pub use follow::{follow_document, FollowExit};
pub use lock::{LockError, LockGuard, LockOutcome, LockRecord, SingletonLock};
pub use orchestrator::{
    AggregateSyncState, HandleEvent, OrchestratorConfig, OrchestratorError, ReplicaHandle,
    ReplicaOrchestrator,
};
pub use transport::{ReplicaConnection, Transport, TransportError, TransportEvent, TransportKind};
