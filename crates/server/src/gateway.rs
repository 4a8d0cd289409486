//! WebSocket entry point: one task per socket, bridging client frames into the
//! relay and draining the connection's outbox back to the client.

use std::{fmt::Debug, future::Future, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::GatewayConfig,
    registry::{ConnectionId, Frame},
    relay::{Dispatch, Relay},
    session::{bearer_token, SessionClaims},
    AppState,
};

pub struct Gateway {
    relay: Relay,
    semaphore: Arc<Semaphore>,
    outbox_capacity: usize,
    send_timeout: Duration,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl Gateway {
    pub fn new(relay: Relay, config: &GatewayConfig) -> Self {
        Self {
            relay,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            outbox_capacity: config.outbox_capacity.max(1),
            send_timeout: config.send_timeout(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub async fn active_connections(&self) -> usize {
        self.relay.registry().len().await
    }

    pub fn open(self: Arc<Self>, ws: WebSocketUpgrade, claims: Option<SessionClaims>) -> Response {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => ws.on_upgrade(move |socket| self.run_socket(socket, claims, permit)),
            Err(_) => {
                warn!("websocket connection limit reached");
                (StatusCode::TOO_MANY_REQUESTS, "connection limit reached").into_response()
            }
        }
    }

    async fn run_socket(
        self: Arc<Self>,
        mut socket: WebSocket,
        claims: Option<SessionClaims>,
        _permit: OwnedSemaphorePermit,
    ) {
        let id = ConnectionId::new();
        let (outbox, mut frames) = mpsc::channel::<Frame>(self.outbox_capacity);
        let registry = self.relay.registry().clone();
        let connection = registry.register(id, outbox).await;
        if let Some(claims) = &claims {
            registry
                .bind(id, &claims.identity, Some(claims.expires_at))
                .await;
        }
        self.connection_opened();
        info!(
            connection = %id,
            identity = ?claims.as_ref().map(|c| c.identity.as_str()),
            "websocket connected"
        );

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    if !self.send(&mut socket, id, frame).await {
                        break;
                    }
                }
                message = socket.recv() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            let dispatch = self.relay.handle_text(id, text.as_str()).await;
                            self.record_dispatch(id, &dispatch);
                            if let Dispatch::Disconnect(err) = dispatch {
                                while let Ok(frame) = frames.try_recv() {
                                    if !self.send(&mut socket, id, frame).await {
                                        break;
                                    }
                                }
                                let close = WsMessage::Close(Some(CloseFrame {
                                    code: close_code::POLICY,
                                    reason: Utf8Bytes::from_static(err.reason()),
                                }));
                                send_within(self.send_timeout, id, socket.send(close)).await;
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let pong = socket.send(WsMessage::Pong(payload));
                            if !send_within(self.send_timeout, id, pong).await {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!(connection = %id, ?err, "websocket receive failed");
                            break;
                        }
                    }
                }
            }
        }

        registry.unregister(id).await;
        self.connection_closed();
        let duration_secs = (Utc::now() - connection.connected_at).num_seconds();
        info!(connection = %id, duration_secs, "websocket disconnected");
    }

    async fn send(&self, socket: &mut WebSocket, id: ConnectionId, frame: Frame) -> bool {
        let message = WsMessage::Text(String::from(&*frame).into());
        send_within(self.send_timeout, id, socket.send(message)).await
    }

    fn record_dispatch(&self, id: ConnectionId, dispatch: &Dispatch) {
        let outcome = dispatch.outcome();
        match dispatch {
            Dispatch::Delivered { event, recipients } => {
                debug!(connection = %id, event, recipients, "relayed event");
            }
            _ => debug!(connection = %id, outcome, "event not relayed"),
        }
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_relay_outcome(outcome);
        }
    }

    fn connection_opened(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.connection_opened();
        }
    }

    fn connection_closed(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.connection_closed();
        }
    }
}

/// Awaits a single socket write, giving up once `limit` elapses.
async fn send_within<E: Debug>(
    limit: Duration,
    id: ConnectionId,
    write: impl Future<Output = Result<(), E>>,
) -> bool {
    match timeout(limit, write).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(connection = %id, ?err, "websocket send failed");
            false
        }
        Err(_) => {
            warn!(connection = %id, "websocket send timeout");
            false
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SocketParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /ws`. A token, when supplied, must be valid; without one the socket
/// opens unbound and may authenticate later.
pub async fn chat_socket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SocketParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let gateway = state.gateway();
    let token = bearer_token(&headers)
        .map(str::to_string)
        .or_else(|| params.token.filter(|token| !token.trim().is_empty()));

    let claims = match token {
        Some(token) => match gateway.relay().gate().authenticate(&token) {
            Ok(claims) => Some(claims),
            Err(err) => {
                debug!(reason = err.reason(), "rejecting websocket upgrade");
                return err.into_response();
            }
        },
        None => None,
    };

    gateway.open(ws, claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{future, io};

    const LIMIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn stalled_writes_are_abandoned() {
        let stalled = future::pending::<Result<(), io::Error>>();
        assert!(!send_within(LIMIT, ConnectionId::new(), stalled).await);
    }

    #[tokio::test]
    async fn completed_and_failed_writes_are_reported() {
        let id = ConnectionId::new();
        assert!(send_within(LIMIT, id, future::ready(Ok::<(), io::Error>(()))).await);

        let refused = future::ready(Err::<(), _>(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!send_within(LIMIT, id, refused).await);
    }
}
