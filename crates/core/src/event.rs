//! Wire events exchanged over the realtime socket.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": <payload>}`.
//! Inbound frames are decoded into [`InboundEvent`] and validated here, before
//! they reach the relay; outbound frames are produced from [`OutboundEvent`].

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::messaging::{format_timestamp, parse_timestamp, DeliveryStatus, MessageView, TimestampError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Authenticate(AuthenticatePayload),
    Typing(Value),
    StoppedTyping(Value),
    MsgStatus(Value),
    SendMessage(SendMessagePayload),
    MessageDelivered(DeliveryAckPayload),
}

impl InboundEvent {
    pub fn decode(frame: &str) -> Result<Self, EventError> {
        let envelope: Envelope =
            serde_json::from_str(frame).map_err(|err| EventError::Malformed(err.to_string()))?;

        match envelope.event.as_str() {
            "authenticate" => payload(envelope.data).map(InboundEvent::Authenticate),
            "typing" => Ok(InboundEvent::Typing(envelope.data)),
            "stopped_typing" => Ok(InboundEvent::StoppedTyping(envelope.data)),
            "msg_status" => Ok(InboundEvent::MsgStatus(envelope.data)),
            "send_message" => payload(envelope.data).map(InboundEvent::SendMessage),
            "message_delivered" => payload(envelope.data).map(InboundEvent::MessageDelivered),
            other => Err(EventError::UnknownEvent(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Authenticate(_) => "authenticate",
            InboundEvent::Typing(_) => "typing",
            InboundEvent::StoppedTyping(_) => "stopped_typing",
            InboundEvent::MsgStatus(_) => "msg_status",
            InboundEvent::SendMessage(_) => "send_message",
            InboundEvent::MessageDelivered(_) => "message_delivered",
        }
    }
}

fn payload<T: DeserializeOwned + Default>(data: Value) -> Result<T, EventError> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|err| EventError::Malformed(err.to_string()))
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AuthenticatePayload {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SendMessagePayload {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A `send_message` payload that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub sender: String,
    pub receiver: String,
    pub text: String,
    pub status: DeliveryStatus,
}

impl SendMessagePayload {
    /// Field values are kept verbatim. A missing or unrecognised `status`
    /// falls back to [`DeliveryStatus::Sent`].
    pub fn validate(self) -> Result<OutgoingMessage, EventError> {
        let sender = required(self.sender, "sender")?;
        let receiver = required(self.receiver, "receiver")?;
        let text = required(self.text, "text")?;
        let status = self
            .status
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DeliveryStatus::Sent);

        Ok(OutgoingMessage {
            sender,
            receiver,
            text,
            status,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DeliveryAckPayload {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A delivery acknowledgement addressing a message by its sender and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryAckPayload {
    pub fn validate(self) -> Result<Acknowledgement, EventError> {
        let sender = required(self.sender, "sender")?;
        let raw = required(self.timestamp, "timestamp")?;
        let timestamp = parse_timestamp(&raw)?;
        Ok(Acknowledgement { sender, timestamp })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, EventError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(EventError::MissingField(field)),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    Authenticated {
        identity: String,
        expires_at: DateTime<Utc>,
    },
    AuthError {
        reason: &'static str,
    },
    UserTyping(Value),
    UserStoppedTyping(Value),
    GetMsgStatus(Value),
    ReceiveMessage(MessageView),
    MessageStatusUpdate {
        timestamp: String,
        status: DeliveryStatus,
    },
}

impl OutboundEvent {
    pub fn delivered(timestamp: &DateTime<Utc>) -> Self {
        OutboundEvent::MessageStatusUpdate {
            timestamp: format_timestamp(timestamp),
            status: DeliveryStatus::Delivered,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Authenticated { .. } => "authenticated",
            OutboundEvent::AuthError { .. } => "auth_error",
            OutboundEvent::UserTyping(_) => "user_typing",
            OutboundEvent::UserStoppedTyping(_) => "user_stopped_typing",
            OutboundEvent::GetMsgStatus(_) => "get_msg_status",
            OutboundEvent::ReceiveMessage(_) => "receive_message",
            OutboundEvent::MessageStatusUpdate { .. } => "message_status_update",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn decodes_typing_with_arbitrary_payload() {
        let event = InboundEvent::decode(r#"{"event":"typing","data":{"user":"a"}}"#).unwrap();
        assert_eq!(event, InboundEvent::Typing(json!({"user": "a"})));
    }

    #[test]
    fn decodes_send_message_and_defaults_status() {
        let event = InboundEvent::decode(
            r#"{"event":"send_message","data":{"sender":"a","receiver":"b","text":"hi"}}"#,
        )
        .unwrap();
        let InboundEvent::SendMessage(payload) = event else {
            panic!("expected send_message");
        };
        let message = payload.validate().expect("valid message");
        assert_eq!(message.sender, "a");
        assert_eq!(message.receiver, "b");
        assert_eq!(message.text, "hi");
        assert_eq!(message.status, DeliveryStatus::Sent);
    }

    #[test]
    fn unknown_and_malformed_frames_are_rejected() {
        assert_eq!(
            InboundEvent::decode(r#"{"event":"join_room","data":{}}"#),
            Err(EventError::UnknownEvent("join_room".into()))
        );
        assert!(matches!(
            InboundEvent::decode("not json"),
            Err(EventError::Malformed(_))
        ));
        assert!(matches!(
            InboundEvent::decode(r#"{"event":"send_message","data":{"sender":7}}"#),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn whitespace_fields_are_kept_and_unknown_status_means_sent() {
        let message = SendMessagePayload {
            sender: Some(" a ".into()),
            receiver: Some("b".into()),
            text: Some("   ".into()),
            status: Some("pending".into()),
        }
        .validate()
        .expect("whitespace is not empty");
        assert_eq!(message.sender, " a ");
        assert_eq!(message.text, "   ");
        assert_eq!(message.status, DeliveryStatus::Sent);
    }

    #[test]
    fn send_message_without_data_fails_validation() {
        let InboundEvent::SendMessage(payload) =
            InboundEvent::decode(r#"{"event":"send_message"}"#).unwrap()
        else {
            panic!("expected send_message");
        };
        assert_eq!(payload.validate(), Err(EventError::MissingField("sender")));
    }

    #[test]
    fn delivery_ack_requires_parsable_timestamp() {
        let ack = DeliveryAckPayload {
            sender: Some("a".into()),
            timestamp: Some("2024-01-02 03:04:05".into()),
        }
        .validate()
        .unwrap();
        assert_eq!(ack.timestamp, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());

        let missing = DeliveryAckPayload {
            sender: Some("a".into()),
            timestamp: None,
        };
        assert_eq!(missing.validate(), Err(EventError::MissingField("timestamp")));

        let garbled = DeliveryAckPayload {
            sender: Some("a".into()),
            timestamp: Some("yesterday".into()),
        };
        assert!(matches!(garbled.validate(), Err(EventError::Timestamp(_))));
    }

    #[test]
    fn outbound_events_use_event_and_data_envelope() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let encoded: Value =
            serde_json::from_str(&OutboundEvent::delivered(&ts).encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({
                "event": "message_status_update",
                "data": {"timestamp": "2024-01-02 03:04:05", "status": "delivered"}
            })
        );

        let typing: Value = serde_json::from_str(
            &OutboundEvent::UserTyping(json!({"user": "a"})).encode().unwrap(),
        )
        .unwrap();
        assert_eq!(typing["event"], "user_typing");
        assert_eq!(typing["data"]["user"], "a");
    }

    proptest! {
        #[test]
        fn empty_text_never_validates(
            sender in "[a-z]{1,12}",
            receiver in "[a-z]{1,12}",
            status in proptest::option::of("[a-z]{0,8}"),
        ) {
            let payload = SendMessagePayload {
                sender: Some(sender),
                receiver: Some(receiver),
                text: Some(String::new()),
                status,
            };
            prop_assert_eq!(payload.validate(), Err(EventError::MissingField("text")));
        }

        #[test]
        fn non_blank_fields_always_validate(
            sender in "[ a-z0-9@.]{1,16}",
            receiver in "[a-z0-9@.]{1,16}",
            text in "[a-z \t]{1,24}",
            status in proptest::option::of("[a-z]{0,8}"),
        ) {
            let payload = SendMessagePayload {
                sender: Some(sender.clone()),
                receiver: Some(receiver.clone()),
                text: Some(text.clone()),
                status: status.clone(),
            };
            let message = payload.validate().unwrap();
            prop_assert_eq!(message.sender, sender);
            prop_assert_eq!(message.receiver, receiver);
            prop_assert_eq!(message.text, text);
            if status.as_deref() != Some("delivered") {
                prop_assert_eq!(message.status, DeliveryStatus::Sent);
            }
        }
    }
}
