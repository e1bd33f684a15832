//! Shared contracts for tandem replicas, relays and the per-machine daemon.

pub mod dispatch;
pub mod doc;
pub mod identity;
pub mod process;
pub mod registry;
pub mod relay_wire;
pub mod telemetry;

pub use dispatch::{evaluate as evaluate_dispatch, ConversationMessage, DispatchDecision, Role, SkipReason};
pub use doc::{DocUpdate, ReplicaDoc};
pub use identity::{
    DocumentIdentity, EpochRejection, IdentityError, DEFAULT_EPOCH, EPOCH_REJECTION_CLOSE_CODE,
};
pub use registry::{room_url, RelayRegistryEntry, DEFAULT_RELAY_PORTS, REGISTRY_PATH};
