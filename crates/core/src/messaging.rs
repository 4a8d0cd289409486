use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire format for message timestamps. Second precision, interpreted as UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp '{0}' does not match YYYY-MM-DD HH:MM:SS")]
    Invalid(String),
}

/// Current time truncated to whole seconds, the granularity messages are stored at.
pub fn message_timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| TimestampError::Invalid(raw.to_string()))
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            other => Err(format!("unsupported delivery status '{other}'")),
        }
    }
}

/// A persisted direct message.
///
/// `id` is assigned by the store and only used to break ties between messages
/// that share a (sender, receiver, timestamp) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub sender: String,
    pub receiver: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl Message {
    /// True when the message was exchanged between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.receiver == b) || (self.sender == b && self.receiver == a)
    }

    pub fn view(&self) -> MessageView {
        MessageView::from(self)
    }
}

/// Client-facing rendering of a message, shared by the history endpoint and
/// the `receive_message` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageView {
    pub sender: String,
    pub receiver: String,
    pub text: String,
    pub timestamp: String,
    pub status: DeliveryStatus,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        Self {
            sender: message.sender.clone(),
            receiver: message.receiver.clone(),
            text: message.text.clone(),
            timestamp: format_timestamp(&message.timestamp),
            status: message.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn timestamps_render_at_second_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-09 07:05:01");
    }

    #[test]
    fn parse_accepts_wire_format_and_rejects_others() {
        let parsed = parse_timestamp("2024-03-09 07:05:01").expect("valid timestamp");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap());

        assert!(parse_timestamp("2024-03-09T07:05:01Z").is_err());
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn now_drops_subsecond_precision() {
        assert_eq!(message_timestamp_now().nanosecond(), 0);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Delivered".parse::<DeliveryStatus>(), Ok(DeliveryStatus::Delivered));
        assert_eq!("sent".parse::<DeliveryStatus>(), Ok(DeliveryStatus::Sent));
        assert!("read".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn is_between_ignores_direction() {
        let message = Message {
            id: 1,
            sender: "a".into(),
            receiver: "b".into(),
            text: "hi".into(),
            timestamp: message_timestamp_now(),
            status: DeliveryStatus::Sent,
        };
        assert!(message.is_between("a", "b"));
        assert!(message.is_between("b", "a"));
        assert!(!message.is_between("a", "c"));
    }
}
