use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use parley_core::{
    message_timestamp_now, parse_timestamp, DeliveryStatus, Message, MessageView,
};
use parley_storage::{MessageRepository, StoragePool};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    response::{required_field, ErrorBody},
    AppState,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Durable record of direct messages and their delivery status.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
        status: DeliveryStatus,
    ) -> Result<Message, StoreError>;
    async fn find_exact(
        &self,
        sender: &str,
        receiver: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError>;
    async fn mark_delivered(
        &self,
        sender: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn delete_exact(
        &self,
        sender: &str,
        receiver: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn history(&self, user_a: &str, user_b: &str) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
impl MessageStore for MessageRepository {
    async fn append(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
        status: DeliveryStatus,
    ) -> Result<Message, StoreError> {
        MessageRepository::append(self, sender, receiver, text, status)
            .await
            .map_err(StoreError::from)
    }

    async fn find_exact(
        &self,
        sender: &str,
        receiver: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        MessageRepository::find_exact(self, sender, receiver, timestamp)
            .await
            .map_err(StoreError::from)
    }

    async fn mark_delivered(
        &self,
        sender: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        MessageRepository::mark_delivered(self, sender, timestamp)
            .await
            .map_err(StoreError::from)
    }

    async fn delete_exact(
        &self,
        sender: &str,
        receiver: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        MessageRepository::delete_exact(self, sender, receiver, timestamp)
            .await
            .map_err(StoreError::from)
    }

    async fn history(&self, user_a: &str, user_b: &str) -> Result<Vec<Message>, StoreError> {
        MessageRepository::history(self, user_a, user_b)
            .await
            .map_err(StoreError::from)
    }
}

/// Messages held in insertion (and therefore id) order behind a single lock.
#[derive(Default)]
pub struct InMemoryMessageStore {
    log: RwLock<MessageLog>,
}

#[derive(Default)]
struct MessageLog {
    messages: Vec<Message>,
    // Never reused, even after the newest message is deleted.
    last_id: i64,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
        status: DeliveryStatus,
    ) -> Result<Message, StoreError> {
        let mut log = self.log.write().await;
        log.last_id += 1;
        let message = Message {
            id: log.last_id,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            text: text.to_string(),
            timestamp: message_timestamp_now(),
            status,
        };
        log.messages.push(message.clone());
        Ok(message)
    }

    async fn find_exact(
        &self,
        sender: &str,
        receiver: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        let log = self.log.read().await;
        Ok(log
            .messages
            .iter()
            .find(|m| m.timestamp == timestamp && m.is_between(sender, receiver))
            .cloned())
    }

    async fn mark_delivered(
        &self,
        sender: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut log = self.log.write().await;
        let mut matches = log
            .messages
            .iter_mut()
            .filter(|m| m.sender == sender && m.timestamp == timestamp)
            .peekable();
        if matches.peek().is_none() {
            return Ok(false);
        }
        if let Some(pending) = matches.find(|m| m.status == DeliveryStatus::Sent) {
            pending.status = DeliveryStatus::Delivered;
        }
        Ok(true)
    }

    async fn delete_exact(
        &self,
        sender: &str,
        receiver: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut log = self.log.write().await;
        match log
            .messages
            .iter()
            .position(|m| m.timestamp == timestamp && m.is_between(sender, receiver))
        {
            Some(index) => {
                log.messages.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn history(&self, user_a: &str, user_b: &str) -> Result<Vec<Message>, StoreError> {
        let log = self.log.read().await;
        let mut conversation: Vec<Message> = log
            .messages
            .iter()
            .filter(|m| m.is_between(user_a, user_b))
            .cloned()
            .collect();
        conversation.sort_by_key(|m| (m.timestamp, m.id));
        Ok(conversation)
    }
}

pub fn init_message_store(pool: Option<StoragePool>) -> Arc<dyn MessageStore> {
    match pool {
        Some(pool) => Arc::new(MessageRepository::new(pool)),
        None => Arc::new(InMemoryMessageStore::new()),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub user1: Option<String>,
    #[serde(default)]
    pub user2: Option<String>,
    /// Exact timestamp of a message between the pair to delete before listing.
    #[serde(default)]
    pub time: Option<String>,
}

/// `POST /messages`: optionally prune one message, then return the pair's history.
///
/// With sessions required, the caller must be one of the pair.
/// Storage failures never surface as errors to the client: the prune is best
/// effort and a failed listing degrades to an empty array with a 500 status.
pub async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<HistoryRequest>,
) -> Response {
    let caller = if state.session_required() {
        match state.session().authorize(&headers) {
            Ok(claims) => Some(claims.identity),
            Err(err) => return err.into_response(),
        }
    } else {
        None
    };

    let mut errors = Vec::new();
    let user1 = required_field(body.user1, "user1", &mut errors);
    let user2 = required_field(body.user2, "user2", &mut errors);
    if !errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(ErrorBody::validation(errors))).into_response();
    }

    if let Some(identity) = caller.filter(|id| *id != user1 && *id != user2) {
        warn!(%identity, %user1, %user2, "history requested by a non-participant");
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorBody::forbidden("not_a_participant")),
        )
            .into_response();
    }

    let store = state.messages();

    if let Some(raw) = body.time.filter(|raw| !raw.trim().is_empty()) {
        match parse_timestamp(&raw) {
            Ok(timestamp) => match store.delete_exact(&user1, &user2, timestamp).await {
                Ok(true) => info!(%user1, %user2, timestamp = %raw, "pruned message"),
                Ok(false) => debug!(%user1, %user2, timestamp = %raw, "no message to prune"),
                Err(err) => warn!(?err, "failed to prune message"),
            },
            Err(err) => warn!(%err, "ignoring prune request with unparsable timestamp"),
        }
    }

    match store.history(&user1, &user2).await {
        Ok(messages) => {
            let views: Vec<MessageView> = messages.iter().map(Message::view).collect();
            (StatusCode::OK, Json(views)).into_response()
        }
        Err(err) => {
            error!(?err, "failed to load conversation history");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Vec::<MessageView>::new()),
            )
                .into_response()
        }
    }
}
