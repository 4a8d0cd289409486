//! Routes decoded client events to the message store and back out through the
//! connection registry.

use std::sync::Arc;

use chrono::Utc;
use parley_core::{
    AuthenticatePayload, DeliveryAckPayload, DeliveryStatus, InboundEvent, OutboundEvent,
    SendMessagePayload,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::DeliveryMode,
    gate::SessionGate,
    messaging::MessageStore,
    registry::{Connection, ConnectionId, ConnectionRegistry},
    session::AuthError,
};

/// What became of a single inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Delivered {
        event: &'static str,
        recipients: usize,
    },
    Dropped(DropReason),
    /// The origin was told why via an `auth_error` frame; the connection stays open.
    Rejected(AuthError),
    /// The origin was told why and must be closed.
    Disconnect(AuthError),
}

impl Dispatch {
    pub fn outcome(&self) -> &'static str {
        match self {
            Dispatch::Delivered { .. } => "delivered",
            Dispatch::Dropped(reason) => reason.as_str(),
            Dispatch::Rejected(_) => "rejected",
            Dispatch::Disconnect(_) => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Invalid,
    SenderMismatch,
    Store,
    Unregistered,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Invalid => "invalid",
            DropReason::SenderMismatch => "sender_mismatch",
            DropReason::Store => "store_error",
            DropReason::Unregistered => "unregistered",
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    gate: SessionGate,
    delivery: DeliveryMode,
}

impl Relay {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        gate: SessionGate,
        delivery: DeliveryMode,
    ) -> Self {
        Self {
            registry,
            store,
            gate,
            delivery,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub async fn handle_text(&self, origin: ConnectionId, frame: &str) -> Dispatch {
        match InboundEvent::decode(frame) {
            Ok(event) => self.handle(origin, event).await,
            Err(err) => {
                debug!(connection = %origin, %err, "dropping undecodable frame");
                Dispatch::Dropped(DropReason::Malformed)
            }
        }
    }

    pub async fn handle(&self, origin: ConnectionId, event: InboundEvent) -> Dispatch {
        let Some(connection) = self.registry.connection(origin).await else {
            return Dispatch::Dropped(DropReason::Unregistered);
        };

        if !matches!(event, InboundEvent::Authenticate(_)) {
            if let Err(err) = self.gate.admit(&connection, Utc::now()) {
                return self.refuse(origin, err).await;
            }
        }

        match event {
            InboundEvent::Authenticate(payload) => self.authenticate(origin, payload).await,
            InboundEvent::Typing(payload) => {
                self.relay_except(origin, OutboundEvent::UserTyping(payload))
                    .await
            }
            InboundEvent::StoppedTyping(payload) => {
                self.relay_except(origin, OutboundEvent::UserStoppedTyping(payload))
                    .await
            }
            InboundEvent::MsgStatus(payload) => {
                self.relay_except(origin, OutboundEvent::GetMsgStatus(payload))
                    .await
            }
            InboundEvent::SendMessage(payload) => self.send_message(&connection, payload).await,
            InboundEvent::MessageDelivered(payload) => self.message_delivered(payload).await,
        }
    }

    async fn refuse(&self, origin: ConnectionId, err: AuthError) -> Dispatch {
        let reply = OutboundEvent::AuthError {
            reason: err.reason(),
        };
        self.registry.send_to_connection(origin, &reply).await;
        match err {
            AuthError::TokenExpired => {
                info!(connection = %origin, "session expired; closing connection");
                Dispatch::Disconnect(err)
            }
            _ => {
                debug!(connection = %origin, reason = err.reason(), "event refused");
                Dispatch::Rejected(err)
            }
        }
    }

    async fn authenticate(&self, origin: ConnectionId, payload: AuthenticatePayload) -> Dispatch {
        let token = payload.token.unwrap_or_default();
        let claims = match self.gate.authenticate(&token) {
            Ok(claims) => claims,
            Err(err) => {
                let reply = OutboundEvent::AuthError {
                    reason: err.reason(),
                };
                self.registry.send_to_connection(origin, &reply).await;
                return Dispatch::Rejected(err);
            }
        };

        if !self
            .registry
            .bind(origin, &claims.identity, Some(claims.expires_at))
            .await
        {
            return Dispatch::Dropped(DropReason::Unregistered);
        }
        info!(connection = %origin, identity = %claims.identity, "connection authenticated");

        let reply = OutboundEvent::Authenticated {
            identity: claims.identity,
            expires_at: claims.expires_at,
        };
        let recipients = usize::from(self.registry.send_to_connection(origin, &reply).await);
        Dispatch::Delivered {
            event: reply.name(),
            recipients,
        }
    }

    async fn relay_except(&self, origin: ConnectionId, event: OutboundEvent) -> Dispatch {
        let recipients = self.registry.broadcast_except(&event, origin).await;
        Dispatch::Delivered {
            event: event.name(),
            recipients,
        }
    }

    async fn send_message(&self, connection: &Connection, payload: SendMessagePayload) -> Dispatch {
        if let Some(raw) = payload.status.as_deref() {
            if raw.parse::<DeliveryStatus>().is_err() {
                debug!(connection = %connection.id, status = %raw, "unrecognised status, storing as sent");
            }
        }
        let outgoing = match payload.validate() {
            Ok(outgoing) => outgoing,
            Err(err) => {
                debug!(connection = %connection.id, %err, "dropping invalid send_message");
                return Dispatch::Dropped(DropReason::Invalid);
            }
        };

        if let Some(identity) = connection.identity.as_deref() {
            if identity != outgoing.sender {
                warn!(
                    connection = %connection.id,
                    %identity,
                    claimed = %outgoing.sender,
                    "dropping message sent on behalf of another identity"
                );
                return Dispatch::Dropped(DropReason::SenderMismatch);
            }
        }

        let stored = match self
            .store
            .append(
                &outgoing.sender,
                &outgoing.receiver,
                &outgoing.text,
                outgoing.status,
            )
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                error!(?err, sender = %outgoing.sender, "failed to persist message");
                return Dispatch::Dropped(DropReason::Store);
            }
        };

        let mut view = stored.view();
        view.status = DeliveryStatus::Sent;
        let event = OutboundEvent::ReceiveMessage(view);

        let recipients = match self.delivery {
            DeliveryMode::Broadcast => self.registry.broadcast_all(&event).await,
            DeliveryMode::Addressed => {
                let mut recipients = self.registry.send_to(&stored.receiver, &event).await;
                if stored.sender != stored.receiver {
                    recipients += self.registry.send_to(&stored.sender, &event).await;
                }
                recipients
            }
        };
        Dispatch::Delivered {
            event: event.name(),
            recipients,
        }
    }

    async fn message_delivered(&self, payload: DeliveryAckPayload) -> Dispatch {
        let ack = match payload.validate() {
            Ok(ack) => ack,
            Err(err) => {
                debug!(%err, "dropping invalid message_delivered");
                return Dispatch::Dropped(DropReason::Invalid);
            }
        };

        match self.store.mark_delivered(&ack.sender, ack.timestamp).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(sender = %ack.sender, timestamp = %ack.timestamp, "delivery ack matched no message");
            }
            Err(err) => {
                error!(?err, sender = %ack.sender, "failed to mark message delivered");
                return Dispatch::Dropped(DropReason::Store);
            }
        }

        // Announced even when nothing matched.
        let event = OutboundEvent::delivered(&ack.timestamp);
        let recipients = match self.delivery {
            DeliveryMode::Broadcast => self.registry.broadcast_all(&event).await,
            DeliveryMode::Addressed => self.registry.send_to(&ack.sender, &event).await,
        };
        Dispatch::Delivered {
            event: event.name(),
            recipients,
        }
    }
}
