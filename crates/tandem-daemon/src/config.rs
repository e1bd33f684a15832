//! Daemon configuration: an optional `daemon.toml` in the state dir, with
//! command-line values layered on top.

use crate::{
    discovery::DiscoveryConfig, orchestrator::OrchestratorConfig, transport::peer::PeerConfig,
};
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use tandem_core::{DocumentIdentity, DEFAULT_EPOCH};
use thiserror::Error;
use url::Url;

pub const CONFIG_FILE_NAME: &str = "daemon.toml";
pub const CACHE_FILE_NAME: &str = "replicas.sqlite3";
pub const LEDGER_FILE_NAME: &str = "epochs.sqlite3";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk shape of `daemon.toml`. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    /// Logical documents to follow, as `namespace:key`.
    pub documents: Vec<String>,
    pub relay_ports: Option<Vec<u16>>,
    pub relay_urls: Vec<String>,
    pub peers: Vec<String>,
    pub peer_bind: Option<String>,
    pub agent_command: Option<Vec<String>>,
    pub entry_document: Option<String>,
    pub probe_timeout_ms: Option<u64>,
}

/// Values given on the command line. Non-empty lists replace the file's.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub documents: Vec<String>,
    pub relay_ports: Vec<u16>,
    pub relay_urls: Vec<String>,
    pub peers: Vec<String>,
    pub peer_bind: Option<String>,
    pub agent_command: Option<String>,
}

/// A logical document, independent of epoch.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DocumentRef {
    pub namespace: String,
    pub key: String,
}

impl DocumentRef {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (namespace, key) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("document {raw:?} is not namespace:key")))?;
        DocumentIdentity::build(namespace, key, DEFAULT_EPOCH)
            .map_err(|err| ConfigError::Invalid(format!("document {raw:?}: {err}")))?;
        Ok(Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
        })
    }

    pub fn at_epoch(&self, epoch: u32) -> Result<DocumentIdentity, ConfigError> {
        DocumentIdentity::build(self.namespace.as_str(), self.key.as_str(), epoch)
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub state_dir: PathBuf,
    pub documents: Vec<DocumentRef>,
    pub entry_document: Option<DocumentRef>,
    pub discovery: DiscoveryConfig,
    pub static_relays: Vec<String>,
    pub peer: PeerConfig,
    pub agent_command: Vec<String>,
}

impl DaemonConfig {
    pub fn resolve(
        state_dir: impl Into<PathBuf>,
        file: FileConfig,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let raw_documents = prefer(overrides.documents, file.documents);
        let mut documents = raw_documents
            .iter()
            .map(|raw| DocumentRef::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        documents.sort();
        documents.dedup();

        let entry_document = file
            .entry_document
            .as_deref()
            .map(DocumentRef::parse)
            .transpose()?;

        let mut discovery = DiscoveryConfig::default();
        let ports = prefer(overrides.relay_ports, file.relay_ports.unwrap_or_default());
        if !ports.is_empty() {
            discovery.ports = ports;
        }
        if let Some(ms) = file.probe_timeout_ms {
            discovery.probe_timeout = Duration::from_millis(ms.max(1));
        }

        let static_relays = prefer(overrides.relay_urls, file.relay_urls)
            .into_iter()
            .map(|raw| validate_relay_url(&raw))
            .collect::<Result<Vec<_>, _>>()?;

        let mut peer = PeerConfig::default();
        peer.peers = prefer(overrides.peers, file.peers)
            .iter()
            .map(|raw| parse_addr("peer", raw))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(bind) = overrides.peer_bind.or(file.peer_bind) {
            peer.bind = parse_addr("peer bind", &bind)?;
        }

        let agent_command = match overrides.agent_command {
            Some(command) => command.split_whitespace().map(str::to_string).collect(),
            None => file.agent_command.unwrap_or_default(),
        };

        Ok(Self {
            state_dir: state_dir.into(),
            documents,
            entry_document,
            discovery,
            static_relays,
            peer,
            agent_command,
        })
    }

    pub fn cache_path(&self) -> PathBuf {
        self.state_dir.join(CACHE_FILE_NAME)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join(LEDGER_FILE_NAME)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(self.cache_path());
        config.discovery = self.discovery.clone();
        config.static_relays = self.static_relays.clone();
        config.peer = self.peer.clone();
        config
    }
}

fn prefer<T>(flag: Vec<T>, file: Vec<T>) -> Vec<T> {
    if flag.is_empty() {
        file
    } else {
        flag
    }
}

fn validate_relay_url(raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ConfigError::Invalid(format!("relay url {raw:?}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url.as_str().trim_end_matches('/').to_string()),
        other => Err(ConfigError::Invalid(format!(
            "relay url {raw:?} must use ws or wss, not {other}"
        ))),
    }
}

fn parse_addr(what: &str, raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|err| ConfigError::Invalid(format!("{what} address {raw:?}: {err}")))
}

/// Reads `daemon.toml`; a missing file is an empty configuration.
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CONFIG_FILE_NAME)
}

/// `--state-dir`, then `TANDEM_STATE_DIR`, then `$HOME/.tandem`.
pub fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(dir) = env::var("TANDEM_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".tandem")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_file_config(&config_path(dir.path())).expect("load");
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn file_values_resolve() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = config_path(dir.path());
        fs::write(
            &path,
            r#"
documents = ["task:t1", "task:t1", "plan:p9"]
relay_ports = [5555]
relay_urls = ["ws://127.0.0.1:7000/"]
peers = ["127.0.0.1:9001"]
agent_command = ["codex", "exec"]
entry_document = "plan:index"
probe_timeout_ms = 250
"#,
        )
        .expect("write");

        let file = load_file_config(&path).expect("load");
        let config =
            DaemonConfig::resolve(dir.path(), file, ConfigOverrides::default()).expect("resolve");
        assert_eq!(
            config.documents.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["plan:p9", "task:t1"]
        );
        assert_eq!(config.discovery.ports, vec![5555]);
        assert_eq!(config.discovery.probe_timeout, Duration::from_millis(250));
        assert_eq!(config.static_relays, vec!["ws://127.0.0.1:7000"]);
        assert_eq!(config.peer.peers, vec!["127.0.0.1:9001".parse::<SocketAddr>().expect("addr")]);
        assert_eq!(config.agent_command, vec!["codex", "exec"]);
        assert_eq!(
            config.entry_document.as_ref().map(ToString::to_string).as_deref(),
            Some("plan:index")
        );
        assert_eq!(config.cache_path(), dir.path().join(CACHE_FILE_NAME));
    }

    #[test]
    fn flags_override_file() {
        let file = FileConfig {
            documents: vec!["task:t1".to_string()],
            relay_ports: Some(vec![5555]),
            agent_command: Some(vec!["from-file".to_string()]),
            ..FileConfig::default()
        };
        let overrides = ConfigOverrides {
            documents: vec!["task:t2".to_string()],
            agent_command: Some("run-agent --fast".to_string()),
            ..ConfigOverrides::default()
        };
        let config = DaemonConfig::resolve("/tmp/state", file, overrides).expect("resolve");
        assert_eq!(config.documents[0].key, "t2");
        assert_eq!(config.discovery.ports, vec![5555]);
        assert_eq!(config.agent_command, vec!["run-agent", "--fast"]);
    }

    #[test]
    fn bad_values_are_rejected() {
        let bad_url = FileConfig {
            relay_urls: vec!["http://127.0.0.1:4444".to_string()],
            ..FileConfig::default()
        };
        assert!(DaemonConfig::resolve("/tmp", bad_url, ConfigOverrides::default()).is_err());

        let bad_doc = ConfigOverrides {
            documents: vec!["no-key".to_string()],
            ..ConfigOverrides::default()
        };
        assert!(DaemonConfig::resolve("/tmp", FileConfig::default(), bad_doc).is_err());
        assert!(DocumentRef::parse("a:b:c").is_err());
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = config_path(dir.path());
        fs::write(&path, "documents = 3").expect("write");
        assert!(matches!(
            load_file_config(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
