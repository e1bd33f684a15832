use crate::dispatch::{ConversationMessage, Role};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One replicated change. Replicas converge by exchanging updates; an update
/// is immutable once created and identified by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocUpdate {
    pub id: String,
    pub origin: String,
    pub ts_ms: i64,
    pub body: Value,
}

impl DocUpdate {
    pub fn new(origin: impl Into<String>, body: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin: origin.into(),
            ts_ms: Utc::now().timestamp_millis(),
            body,
        }
    }

    /// Builds a conversation message update.
    pub fn message(origin: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        Self::new(
            origin,
            serde_json::json!({
                "kind": "message",
                "role": role.as_str(),
                "text": text.into(),
            }),
        )
    }

    fn as_message(&self) -> Option<ConversationMessage> {
        let body = self.body.as_object()?;
        if body.get("kind").and_then(Value::as_str) != Some("message") {
            return None;
        }
        let role = match body.get("role").and_then(Value::as_str)? {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => return None,
        };
        Some(ConversationMessage::new(self.id.clone(), role))
    }
}

/// Grow-only set of updates. Merging is a union, so applying the same update
/// twice or in any order yields the same document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaDoc {
    updates: BTreeMap<String, DocUpdate>,
}

impl ReplicaDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_updates(updates: impl IntoIterator<Item = DocUpdate>) -> Self {
        let mut doc = Self::new();
        doc.merge(updates);
        doc
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.updates.contains_key(id)
    }

    /// Returns true when the update was new.
    pub fn apply(&mut self, update: DocUpdate) -> bool {
        if self.updates.contains_key(&update.id) {
            return false;
        }
        self.updates.insert(update.id.clone(), update);
        true
    }

    /// Applies a batch and returns the updates that were not already present.
    pub fn merge(&mut self, updates: impl IntoIterator<Item = DocUpdate>) -> Vec<DocUpdate> {
        let mut fresh = Vec::new();
        for update in updates {
            if self.apply(update.clone()) {
                fresh.push(update);
            }
        }
        fresh
    }

    pub fn updates(&self) -> Vec<DocUpdate> {
        self.updates.values().cloned().collect()
    }

    /// Ordered conversation view: message updates sorted by timestamp, then id.
    pub fn conversation(&self) -> Vec<ConversationMessage> {
        let mut messages: Vec<&DocUpdate> = self
            .updates
            .values()
            .filter(|update| update.as_message().is_some())
            .collect();
        messages.sort_by(|a, b| a.ts_ms.cmp(&b.ts_ms).then_with(|| a.id.cmp(&b.id)));
        messages
            .into_iter()
            .filter_map(DocUpdate::as_message)
            .collect()
    }
}
