use crate::doc::DocUpdate;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

/// Frame exchanged between a replica and a relay (and between peers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(flatten)]
    pub msg: RelayMsg,
}

impl RelayEnvelope {
    pub fn new(msg: RelayMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayMsg {
    /// Relay -> replica, first frame after the epoch gate admits a connection.
    Welcome(WelcomePayload),
    /// Full update set; relays send one right after `Welcome`, replicas send
    /// one on connect so the relay learns what it is missing.
    Snapshot(SnapshotPayload),
    Update(UpdatePayload),
    /// Ephemeral state, forwarded to the room and never stored.
    Presence(PresencePayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomePayload {
    pub conn_id: String,
    pub document: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPayload {
    #[serde(default)]
    pub updates: Vec<DocUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatePayload {
    #[serde(default)]
    pub updates: Vec<DocUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresencePayload {
    pub sender: String,
    #[serde(default)]
    pub state: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
}

pub fn encode_text<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_bytes<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Decodes an envelope and refuses versions newer than this build speaks.
pub fn decode_envelope(bytes: &[u8]) -> Result<RelayEnvelope, FrameError> {
    let envelope: RelayEnvelope = decode_bytes(bytes, DEFAULT_MAX_FRAME_BYTES)?;
    if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(envelope.version.0));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_type_and_payload_fields() {
        let envelope = RelayEnvelope::new(RelayMsg::Welcome(WelcomePayload {
            conn_id: "conn-1".to_string(),
            document: "task:t1:2".to_string(),
        }));
        let text = encode_text(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let raw: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(raw["version"], "1");
        assert_eq!(raw["type"], "welcome");
        assert_eq!(raw["payload"]["conn_id"], "conn-1");
        assert_eq!(decode_envelope(text.as_bytes()).expect("decode"), envelope);
    }

    #[test]
    fn version_accepts_numbers_and_prefixed_strings() {
        let raw = r#"{"version":"v1","type":"update","payload":{"updates":[]}}"#;
        let envelope = decode_envelope(raw.as_bytes()).expect("decode");
        assert_eq!(envelope.version, ProtocolVersion(1));

        let raw = r#"{"version":1,"type":"presence","payload":{"sender":"a"}}"#;
        let envelope = decode_envelope(raw.as_bytes()).expect("decode");
        assert!(matches!(envelope.msg, RelayMsg::Presence(_)));
    }

    #[test]
    fn newer_versions_are_rejected() {
        let raw = r#"{"version":"9","type":"update","payload":{"updates":[]}}"#;
        assert_eq!(
            decode_envelope(raw.as_bytes()),
            Err(FrameError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn oversized_frames_fail() {
        let envelope = RelayEnvelope::new(RelayMsg::Error(ErrorPayload {
            code: "x".repeat(64),
            message: "too big".to_string(),
        }));
        let err = encode_text(&envelope, 16).unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame { max: 16, .. }));
        assert!(matches!(
            decode_bytes::<RelayEnvelope>(&[b' '; 32], 8),
            Err(FrameError::OversizedFrame { size: 32, max: 8 })
        ));
    }
}
