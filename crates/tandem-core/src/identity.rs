use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Epoch every new replica starts at until a relay demands a newer one.
pub const DEFAULT_EPOCH: u32 = 2;

/// Application close code a relay uses when the client's epoch is too old.
pub const EPOCH_REJECTION_CLOSE_CODE: u16 = 4100;

const EPOCH_REJECTION_PREFIX: &str = "epoch_too_old:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Names one physical replica: a logical document (`namespace:key`) at a
/// specific epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentIdentity {
    namespace: String,
    key: String,
    epoch: u32,
}

impl DocumentIdentity {
    pub fn build(
        namespace: impl Into<String>,
        key: impl Into<String>,
        epoch: u32,
    ) -> Result<Self, IdentityError> {
        let namespace = namespace.into();
        let key = key.into();
        validate_component("namespace", &namespace)?;
        validate_component("key", &key)?;
        if epoch < 1 {
            return Err(IdentityError::InvalidArgument(format!(
                "epoch must be >= 1, got {epoch}"
            )));
        }
        Ok(Self {
            namespace,
            key,
            epoch,
        })
    }

    /// Parses `namespace:key:epoch`. Malformed input yields `None`.
    pub fn parse(serialized: &str) -> Option<Self> {
        let mut parts = serialized.split(':');
        let namespace = parts.next()?;
        let key = parts.next()?;
        let epoch = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let epoch = epoch.parse::<u32>().ok()?;
        Self::build(namespace, key, epoch).ok()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// The logical document this replica belongs to, independent of epoch.
    pub fn doc_key(&self) -> String {
        format!("{}:{}", self.namespace, self.key)
    }

    pub fn with_epoch(&self, epoch: u32) -> Result<Self, IdentityError> {
        Self::build(self.namespace.clone(), self.key.clone(), epoch)
    }
}

fn validate_component(field: &str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::InvalidArgument(format!(
            "{field} must not be empty"
        )));
    }
    if value.contains(':') {
        return Err(IdentityError::InvalidArgument(format!(
            "{field} must not contain ':' ({value})"
        )));
    }
    Ok(())
}

impl fmt::Display for DocumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.key, self.epoch)
    }
}

impl FromStr for DocumentIdentity {
    type Err = IdentityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input).ok_or_else(|| {
            IdentityError::InvalidArgument(format!("malformed document identity: {input}"))
        })
    }
}

impl Serialize for DocumentIdentity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DocumentIdentity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdentityVisitor;

        impl<'de> Visitor<'de> for IdentityVisitor {
            type Value = DocumentIdentity;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a document identity of the form namespace:key:epoch")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                DocumentIdentity::parse(value)
                    .ok_or_else(|| E::custom(format!("invalid document identity '{value}'")))
            }
        }

        deserializer.deserialize_str(IdentityVisitor)
    }
}

/// Decoded form of the relay's stale-epoch close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochRejection {
    pub required_epoch: u32,
}

impl EpochRejection {
    pub fn new(required_epoch: u32) -> Self {
        Self { required_epoch }
    }

    pub fn code(&self) -> u16 {
        EPOCH_REJECTION_CLOSE_CODE
    }

    pub fn reason(&self) -> String {
        format!("{EPOCH_REJECTION_PREFIX}{}", self.required_epoch)
    }

    /// Recognizes the rejection among arbitrary close frames. Any other code,
    /// or a reason that does not carry a valid epoch, is not a rejection.
    pub fn from_close(code: u16, reason: &str) -> Option<Self> {
        if code != EPOCH_REJECTION_CLOSE_CODE {
            return None;
        }
        let raw = reason.trim().strip_prefix(EPOCH_REJECTION_PREFIX)?;
        let required_epoch = raw.parse::<u32>().ok()?;
        if required_epoch < 1 {
            return None;
        }
        Some(Self { required_epoch })
    }
}
