//! Starts the configured agent command when a followed document gains a new
//! user turn. One `Dispatcher` per document. With a journal attached, each
//! turn is claimed in the epoch ledger before it runs, so restarts and
//! rebuilt replicas never run it again.

use crate::epoch::EpochRecoveryStore;
use std::{collections::BTreeSet, process::Stdio};
use tandem_core::{evaluate_dispatch, ConversationMessage, DispatchDecision, DocumentIdentity, SkipReason};
use tokio::{process::Command, sync::mpsc};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchState {
    pub last_processed_index: i64,
    pub active: bool,
    pub last_dispatched: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started { message_id: String, index: usize },
    Skipped(SkipReason),
    /// The gate picked a turn that was already dispatched.
    Duplicate { message_id: String },
    /// Dispatch was due but no agent command is configured.
    NoCommand { message_id: String },
    /// The turn could not be claimed in the journal; it is retried on the
    /// next change.
    Unrecorded { message_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunFinished {
    pub message_id: String,
    pub exit_code: Option<i32>,
}

pub struct Dispatcher {
    command: Vec<String>,
    state: DispatchState,
    dispatched: BTreeSet<String>,
    journal: Option<EpochRecoveryStore>,
    finished_tx: mpsc::Sender<RunFinished>,
    finished_rx: mpsc::Receiver<RunFinished>,
}

impl Dispatcher {
    pub fn new(command: Vec<String>) -> Self {
        let (finished_tx, finished_rx) = mpsc::channel(8);
        Self {
            command,
            state: DispatchState::default(),
            dispatched: BTreeSet::new(),
            journal: None,
            finished_tx,
            finished_rx,
        }
    }

    /// Claims turns in the ledger instead of only in memory.
    pub fn with_journal(mut self, journal: EpochRecoveryStore) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    /// Rescan from the start, e.g. after the replica was rebuilt. Turns
    /// already dispatched stay claimed.
    pub fn reset(&mut self) {
        self.state.last_processed_index = 0;
    }

    pub async fn on_change(
        &mut self,
        identity: &DocumentIdentity,
        conversation: &[ConversationMessage],
    ) -> DispatchOutcome {
        let decision = evaluate_dispatch(
            conversation,
            self.state.last_processed_index,
            self.state.active,
        );
        let (message, index) = match decision {
            DispatchDecision::Skip(reason) => {
                debug!(event = "dispatch_skip", document = %identity, reason = %reason);
                return DispatchOutcome::Skipped(reason);
            }
            DispatchDecision::Dispatch {
                last_user_message,
                index,
            } => (last_user_message, index),
        };
        if !self.claim(identity, &message.id).await {
            if self.dispatched.contains(&message.id) {
                self.state.last_processed_index = index as i64 + 1;
                return DispatchOutcome::Duplicate {
                    message_id: message.id,
                };
            }
            return DispatchOutcome::Unrecorded {
                message_id: message.id,
            };
        }
        self.state.last_processed_index = index as i64 + 1;
        self.state.last_dispatched = Some(message.id.clone());

        if self.command.is_empty() {
            info!(
                event = "dispatch_no_command",
                document = %identity,
                message_id = %message.id
            );
            return DispatchOutcome::NoCommand {
                message_id: message.id,
            };
        }

        self.state.active = true;
        info!(
            event = "dispatch_start",
            document = %identity,
            message_id = %message.id,
            index = index
        );
        let command = self.command.clone();
        let document = identity.to_string();
        let message_id = message.id.clone();
        let finished_tx = self.finished_tx.clone();
        tokio::spawn(async move {
            let exit_code = run_agent(&command, &document, &message_id).await;
            let _ = finished_tx
                .send(RunFinished {
                    message_id,
                    exit_code,
                })
                .await;
        });
        DispatchOutcome::Started {
            message_id: message.id,
            index,
        }
    }

    /// True when this call claimed the turn. A turn already claimed ends up
    /// in `dispatched`; a journal failure leaves it unclaimed.
    async fn claim(&mut self, identity: &DocumentIdentity, message_id: &str) -> bool {
        if self.dispatched.contains(message_id) {
            return false;
        }
        if let Some(journal) = &self.journal {
            match journal.record_dispatch(&identity.doc_key(), message_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(event = "dispatch_already_claimed", document = %identity, message_id = %message_id);
                    self.dispatched.insert(message_id.to_string());
                    return false;
                }
                Err(err) => {
                    warn!(
                        event = "dispatch_journal_failed",
                        document = %identity,
                        message_id = %message_id,
                        error = %err
                    );
                    return false;
                }
            }
        }
        self.dispatched.insert(message_id.to_string());
        true
    }

    /// Waits for the running agent to exit.
    pub async fn next_finished(&mut self) -> Option<RunFinished> {
        self.finished_rx.recv().await
    }

    pub fn on_finished(&mut self, finished: &RunFinished) {
        self.state.active = false;
        info!(
            event = "dispatch_finished",
            message_id = %finished.message_id,
            exit_code = ?finished.exit_code
        );
    }
}

async fn run_agent(command: &[String], document: &str, message_id: &str) -> Option<i32> {
    let (program, args) = command.split_first()?;
    let mut child = match Command::new(program)
        .args(args)
        .env("TANDEM_DOCUMENT", document)
        .env("TANDEM_MESSAGE_ID", message_id)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            error!(event = "dispatch_spawn_failed", program = %program, error = %err);
            return None;
        }
    };
    match child.wait().await {
        Ok(status) => status.code(),
        Err(err) => {
            error!(event = "dispatch_wait_failed", error = %err);
            None
        }
    }
}
