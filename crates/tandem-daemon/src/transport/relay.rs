use super::{
    emit, next_backoff, set_local_id, signalled, Outbound, TaskSide, Transport, TransportError,
    TransportEvent, TransportId, TransportKind, TransportLink,
};
use futures_util::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tandem_core::{
    relay_wire::{
        decode_envelope, encode_text, PresencePayload, RelayEnvelope, RelayMsg, SnapshotPayload,
        UpdatePayload, DEFAULT_MAX_FRAME_BYTES,
    },
    EpochRejection, ReplicaDoc,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, RwLock},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct RelayTransportConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for RelayTransportConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// WebSocket link to one relay room. Reconnects with backoff until closed or
/// rejected for a stale epoch.
pub struct RelayTransport {
    url: String,
    link: TransportLink,
}

impl RelayTransport {
    pub fn spawn(
        id: TransportId,
        url: String,
        config: RelayTransportConfig,
        doc: Arc<RwLock<ReplicaDoc>>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (link, side) = TransportLink::new(None);
        let task_url = url.clone();
        tokio::spawn(async move {
            run_relay(id, task_url, config, doc, events, side).await;
        });
        Self { url, link }
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn local_transport_id(&self) -> Option<String> {
        self.link.local_id()
    }

    fn send(&self, frame: Outbound) -> Result<(), TransportError> {
        self.link.send(frame)
    }

    fn close(&self) {
        self.link.close();
    }
}

enum SessionEnd {
    Closed,
    Rejected(u32),
    Lost(String),
}

async fn sleep_or_close(close: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = signalled(close) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_relay(
    id: TransportId,
    url: String,
    config: RelayTransportConfig,
    doc: Arc<RwLock<ReplicaDoc>>,
    events: mpsc::Sender<TransportEvent>,
    mut side: TaskSide,
) {
    let mut backoff = config.initial_backoff;
    loop {
        if *side.close.borrow() {
            return;
        }
        let connect = tokio::select! {
            _ = signalled(&mut side.close) => return,
            result = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str())) => result,
        };
        let mut ws = match connect {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(err)) => {
                debug!(event = "relay_connect_error", url = %url, error = %err);
                if !sleep_or_close(&mut side.close, backoff).await {
                    return;
                }
                backoff = next_backoff(backoff, config.max_backoff);
                continue;
            }
            Err(_) => {
                debug!(event = "relay_connect_timeout", url = %url);
                if !sleep_or_close(&mut side.close, backoff).await {
                    return;
                }
                backoff = next_backoff(backoff, config.max_backoff);
                continue;
            }
        };
        if *side.close.borrow() {
            let _ = ws.close(None).await;
            return;
        }
        backoff = config.initial_backoff;
        info!(event = "relay_connected", url = %url, transport = id);
        if !emit(&events, TransportEvent::Connected { id }).await {
            let _ = ws.close(None).await;
            return;
        }

        let snapshot = doc.read().await.updates();
        let hello = RelayEnvelope::new(RelayMsg::Snapshot(SnapshotPayload { updates: snapshot }));
        let end = match encode_text(&hello, config.max_frame_bytes) {
            Ok(text) => match ws.send(Message::Text(text)).await {
                Ok(()) => session(id, &mut ws, &mut side, &events, config.max_frame_bytes).await,
                Err(err) => SessionEnd::Lost(err.to_string()),
            },
            Err(err) => {
                warn!(event = "relay_snapshot_too_large", url = %url, error = %err);
                session(id, &mut ws, &mut side, &events, config.max_frame_bytes).await
            }
        };
        set_local_id(&side.local_id, None);

        match end {
            SessionEnd::Closed => {
                let _ = ws.close(None).await;
                let _ = emit(
                    &events,
                    TransportEvent::Disconnected {
                        id,
                        reason: "closed".to_string(),
                    },
                )
                .await;
                info!(event = "relay_closed", url = %url, transport = id);
                return;
            }
            SessionEnd::Rejected(required_epoch) => {
                warn!(
                    event = "relay_epoch_rejected",
                    url = %url,
                    required_epoch = required_epoch
                );
                let _ = emit(
                    &events,
                    TransportEvent::EpochRejected { id, required_epoch },
                )
                .await;
                return;
            }
            SessionEnd::Lost(reason) => {
                info!(event = "relay_disconnected", url = %url, reason = %reason);
                if !emit(&events, TransportEvent::Disconnected { id, reason }).await {
                    return;
                }
                if !sleep_or_close(&mut side.close, backoff).await {
                    return;
                }
                backoff = next_backoff(backoff, config.max_backoff);
            }
        }
    }
}

async fn session(
    id: TransportId,
    ws: &mut RelaySocket,
    side: &mut TaskSide,
    events: &mpsc::Sender<TransportEvent>,
    max_frame_bytes: usize,
) -> SessionEnd {
    let mut synced = false;
    loop {
        tokio::select! {
            _ = signalled(&mut side.close) => return SessionEnd::Closed,
            frame = side.outbound.recv() => {
                let Some(frame) = frame else {
                    return SessionEnd::Closed;
                };
                let msg = match frame {
                    Outbound::Updates(updates) => RelayMsg::Update(UpdatePayload { updates }),
                    Outbound::Presence { sender, state } => {
                        RelayMsg::Presence(PresencePayload { sender, state })
                    }
                };
                match encode_text(&RelayEnvelope::new(msg), max_frame_bytes) {
                    Ok(text) => {
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            return SessionEnd::Lost(err.to_string());
                        }
                    }
                    Err(err) => warn!(event = "relay_frame_dropped", transport = id, error = %err),
                }
            }
            incoming = ws.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                    None => return SessionEnd::Lost("eof".to_string()),
                };
                let data = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(frame) => {
                        let Some(frame) = frame else {
                            return SessionEnd::Lost("close".to_string());
                        };
                        let code = u16::from(frame.code);
                        if let Some(rejection) = EpochRejection::from_close(code, &frame.reason) {
                            return SessionEnd::Rejected(rejection.required_epoch);
                        }
                        return SessionEnd::Lost(format!("close {code}: {}", frame.reason));
                    }
                    _ => continue,
                };
                let envelope = match decode_envelope(&data) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(event = "relay_frame_invalid", transport = id, error = %err);
                        continue;
                    }
                };
                let delivered = match envelope.msg {
                    RelayMsg::Welcome(payload) => {
                        debug!(event = "relay_welcome", transport = id, conn_id = %payload.conn_id);
                        set_local_id(&side.local_id, Some(payload.conn_id));
                        true
                    }
                    RelayMsg::Snapshot(payload) => {
                        let mut ok = true;
                        if !payload.updates.is_empty() {
                            ok = emit(events, TransportEvent::Updates { id, updates: payload.updates }).await;
                        }
                        if ok && !synced {
                            synced = true;
                            ok = emit(events, TransportEvent::Synced { id }).await;
                        }
                        ok
                    }
                    RelayMsg::Update(payload) => {
                        emit(events, TransportEvent::Updates { id, updates: payload.updates }).await
                    }
                    RelayMsg::Presence(payload) => {
                        emit(
                            events,
                            TransportEvent::Presence {
                                id,
                                sender: payload.sender,
                                state: payload.state,
                            },
                        )
                        .await
                    }
                    RelayMsg::Error(payload) => {
                        warn!(event = "relay_error", transport = id, code = %payload.code, message = %payload.message);
                        true
                    }
                };
                if !delivered {
                    return SessionEnd::Closed;
                }
            }
        }
    }
}
