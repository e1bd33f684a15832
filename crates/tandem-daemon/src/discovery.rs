//! Finds relays running on this machine by asking each well-known port for
//! its `/registry`. Every pass is independent; failed ports are not
//! remembered.

use futures_util::future::join_all;
use http_body_util::{BodyExt, Empty};
use hyper::{body::Bytes, Request, StatusCode, Uri};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::time::Duration;
use tandem_core::{RelayRegistryEntry, DEFAULT_RELAY_PORTS, REGISTRY_PATH};
use thiserror::Error;
use tracing::debug;

pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("probe of port {port} timed out")]
    ProbeTimeout { port: u16 },
    #[error("port {port} unreachable: {message}")]
    Unreachable { port: u16, message: String },
    #[error("port {port} answered with http status {status}")]
    HttpStatus { port: u16, status: u16 },
    #[error("port {port} returned an invalid registry: {message}")]
    InvalidRegistry { port: u16, message: String },
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub ports: Vec<u16>,
    pub host: String,
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: DEFAULT_RELAY_PORTS.to_vec(),
            host: "localhost".to_string(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct RelayDiscovery {
    config: DiscoveryConfig,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl RelayDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
        Self { config, client }
    }

    /// Fetches one port's registry, bounded by the probe timeout.
    pub async fn probe(&self, port: u16) -> Result<Vec<RelayRegistryEntry>, DiscoveryError> {
        match tokio::time::timeout(self.config.probe_timeout, self.fetch(port)).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::ProbeTimeout { port }),
        }
    }

    async fn fetch(&self, port: u16) -> Result<Vec<RelayRegistryEntry>, DiscoveryError> {
        let uri = format!("http://{}:{port}{REGISTRY_PATH}", self.config.host)
            .parse::<Uri>()
            .map_err(|err| DiscoveryError::Unreachable {
                port,
                message: err.to_string(),
            })?;
        let request = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|err| DiscoveryError::Unreachable {
                port,
                message: err.to_string(),
            })?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| DiscoveryError::Unreachable {
                port,
                message: err.to_string(),
            })?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(DiscoveryError::HttpStatus {
                port,
                status: status.as_u16(),
            });
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| DiscoveryError::Unreachable {
                port,
                message: err.to_string(),
            })?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|err| DiscoveryError::InvalidRegistry {
            port,
            message: err.to_string(),
        })
    }

    /// Probes every configured port at once and returns the registry from the
    /// first port, in list order, that answered with a non-empty one. Finding
    /// nothing is not an error.
    pub async fn discover(&self) -> Vec<RelayRegistryEntry> {
        let probes = self.config.ports.iter().map(|port| self.probe(*port));
        let results = join_all(probes).await;
        for (port, result) in self.config.ports.iter().zip(results) {
            match result {
                Ok(entries) if !entries.is_empty() => {
                    debug!(event = "discovery_found", port = port, relays = entries.len());
                    return entries;
                }
                Ok(_) => debug!(event = "discovery_empty", port = port),
                Err(err) => debug!(event = "discovery_probe_failed", port = port, error = %err),
            }
        }
        debug!(event = "discovery_none", ports = ?self.config.ports);
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_relay::{serve, RelayConfig};
    use tokio::{net::TcpListener, sync::watch};

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    }

    fn discovery(ports: Vec<u16>) -> RelayDiscovery {
        RelayDiscovery::new(DiscoveryConfig {
            ports,
            host: "127.0.0.1".to_string(),
            probe_timeout: Duration::from_millis(300),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_live_port_in_list_order_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (shutdown, rx) = watch::channel(false);
        let relay = tokio::spawn(serve(listener, RelayConfig::default(), rx));

        let dead = closed_port().await;
        let found = discovery(vec![dead, port]).discover().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, port);

        let _ = shutdown.send(true);
        let _ = relay.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_port_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let hold = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });

        let probe = discovery(vec![port]);
        match probe.probe(port).await {
            Err(DiscoveryError::ProbeTimeout { port: timed_out }) => assert_eq!(timed_out, port),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(probe.discover().await.is_empty());
        hold.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nothing_listening_is_not_an_error() {
        let port = closed_port().await;
        let probe = discovery(vec![port]);
        assert!(matches!(
            probe.probe(port).await,
            Err(DiscoveryError::Unreachable { .. })
        ));
        assert!(probe.discover().await.is_empty());
    }
}
