//! Core domain types and wire events for the Parley chat backend.

pub mod event;
pub mod messaging;

pub use event::{
    Acknowledgement, AuthenticatePayload, DeliveryAckPayload, EventError, InboundEvent,
    OutboundEvent, OutgoingMessage, SendMessagePayload,
};
pub use messaging::{
    format_timestamp, message_timestamp_now, parse_timestamp, DeliveryStatus, Message,
    MessageView, TimestampError, TIMESTAMP_FORMAT,
};
