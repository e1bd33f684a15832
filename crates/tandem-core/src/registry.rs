use serde::{Deserialize, Serialize};

/// Path every relay serves its machine-local registry on.
pub const REGISTRY_PATH: &str = "/registry";

/// Ports relays bind by default, in the order discovery probes them.
pub const DEFAULT_RELAY_PORTS: &[u16] = &[4444, 4445, 4446];

/// One running relay process on this machine, as listed by `GET /registry`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayRegistryEntry {
    pub port: u16,
    pub pid: u32,
    pub url: String,
    pub registered_at: String,
}

impl RelayRegistryEntry {
    /// WebSocket URL of the room serving `document` on this relay.
    pub fn room_url(&self, document: &str) -> String {
        room_url(&self.url, document)
    }
}

/// Joins a relay base URL and a serialized document identity.
pub fn room_url(base: &str, document: &str) -> String {
    format!("{}/ws/{document}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_json_uses_camel_case() {
        let raw = r#"[{"port":4444,"pid":12,"url":"ws://127.0.0.1:4444","registeredAt":"2026-02-07T21:00:00Z"}]"#;
        let entries: Vec<RelayRegistryEntry> = serde_json::from_str(raw).expect("parse");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].port, 4444);
        assert_eq!(entries[0].registered_at, "2026-02-07T21:00:00Z");

        let back = serde_json::to_value(&entries[0]).expect("serialize");
        assert!(back.get("registeredAt").is_some());
    }

    #[test]
    fn room_url_appends_document() {
        let entry = RelayRegistryEntry {
            port: 4444,
            pid: 1,
            url: "ws://127.0.0.1:4444/".to_string(),
            registered_at: String::new(),
        };
        assert_eq!(entry.room_url("task:t1:2"), "ws://127.0.0.1:4444/ws/task:t1:2");
    }
}
