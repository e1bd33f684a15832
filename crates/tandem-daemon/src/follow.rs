//! Keeps one document replicated for the lifetime of the daemon, rebuilding
//! the replica whenever a relay rejects its epoch. A hard reset moves the
//! follower to the configured entry document.

use crate::{
    config::DocumentRef,
    dispatcher::Dispatcher,
    epoch::{EpochError, EpochRecoveryStore, RecoveryOutcome},
    orchestrator::{HandleEvent, OrchestratorConfig, ReplicaHandle, ReplicaOrchestrator},
    transport::signalled,
};
use tandem_core::DocumentIdentity;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowExit {
    Shutdown,
    /// Epoch recovery gave up; the document needs `reset-cache`.
    Exhausted,
    Failed(String),
}

pub async fn follow_document(
    document: DocumentRef,
    store: EpochRecoveryStore,
    config: OrchestratorConfig,
    agent_command: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) -> FollowExit {
    let mut identity = match store
        .identity_for(&document.namespace, &document.key)
        .await
    {
        Ok(identity) => identity,
        Err(err) => return FollowExit::Failed(err.to_string()),
    };
    let new_dispatcher = || Dispatcher::new(agent_command.clone()).with_journal(store.clone());
    let mut dispatcher = new_dispatcher();

    loop {
        let mut handle = match ReplicaOrchestrator::start(identity.clone(), config.clone()).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(event = "follow_start_failed", document = %identity, error = %err);
                return FollowExit::Failed(err.to_string());
            }
        };
        info!(event = "follow_start", document = %identity);

        let required_epoch = loop {
            tokio::select! {
                _ = signalled(&mut shutdown) => {
                    handle.shutdown().await;
                    return FollowExit::Shutdown;
                }
                finished = dispatcher.next_finished() => {
                    if let Some(finished) = finished {
                        dispatcher.on_finished(&finished);
                        evaluate(&mut dispatcher, &handle, &identity).await;
                    }
                }
                event = handle.next_event() => match event {
                    Some(HandleEvent::DocumentChanged { .. }) => {
                        evaluate(&mut dispatcher, &handle, &identity).await;
                    }
                    Some(HandleEvent::Presence { .. }) => {}
                    Some(HandleEvent::EpochRejected { required_epoch }) => break required_epoch,
                    None => {
                        handle.shutdown().await;
                        return FollowExit::Failed("replica closed".to_string());
                    }
                }
            }
        };
        handle.shutdown().await;

        match store.handle_rejection(&identity, required_epoch).await {
            Ok(outcome) => match next_document(&identity, outcome) {
                NextDocument::Same(next) => {
                    dispatcher.reset();
                    identity = next;
                }
                NextDocument::Switch(entry) => {
                    warn!(event = "follow_hard_reset", from = %identity, entry = %entry);
                    dispatcher = new_dispatcher();
                    identity = entry;
                }
            },
            Err(EpochError::ResetExhausted { doc_key, attempts }) => {
                error!(
                    event = "follow_reset_exhausted",
                    document = %doc_key,
                    attempts = attempts,
                    "manual intervention required: run `tandem-daemon reset-cache {doc_key}`"
                );
                return FollowExit::Exhausted;
            }
            Err(err) => {
                error!(event = "follow_recovery_failed", document = %identity, error = %err);
                return FollowExit::Failed(err.to_string());
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum NextDocument {
    /// Same logical document, usually at a raised epoch.
    Same(DocumentIdentity),
    /// A hard reset moved the replica to the entry document.
    Switch(DocumentIdentity),
}

fn next_document(current: &DocumentIdentity, outcome: RecoveryOutcome) -> NextDocument {
    let next = outcome.next_identity().clone();
    if next.doc_key() == current.doc_key() {
        NextDocument::Same(next)
    } else {
        NextDocument::Switch(next)
    }
}

async fn evaluate(dispatcher: &mut Dispatcher, handle: &ReplicaHandle, identity: &DocumentIdentity) {
    let conversation = handle.doc().read().await.conversation();
    dispatcher.on_change(identity, &conversation).await;
}
