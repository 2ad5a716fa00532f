// Chat destinations and inbound event decoding.

use serde::de::DeserializeOwned;
use thiserror::Error;

use mealmate_core::protocol::{
    ChatMessage, SendAck, ServerErrorBody, UnreadCount, UnreadCountUpdate,
};

/// Destination the client publishes heartbeats to.
pub const PING_DESTINATION: &str = "/app/ping";

/// Every inbound stream the chat screen subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Messages,
    UnreadCounts,
    SendAck,
    Errors,
    Pong,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Messages,
        Channel::UnreadCounts,
        Channel::SendAck,
        Channel::Errors,
        Channel::Pong,
    ];

    pub fn destination(self, meeting_id: u64) -> String {
        match self {
            Channel::Messages => format!("/topic/meetings/{meeting_id}/messages"),
            Channel::UnreadCounts => format!("/topic/meetings/{meeting_id}/unread"),
            Channel::SendAck => "/user/queue/chat-ack".to_string(),
            Channel::Errors => "/user/queue/errors".to_string(),
            Channel::Pong => "/user/queue/pong".to_string(),
        }
    }

    /// Subscription id used in SUBSCRIBE and echoed back on MESSAGE frames.
    pub fn subscription_id(self) -> &'static str {
        match self {
            Channel::Messages => "sub-messages",
            Channel::UnreadCounts => "sub-unread",
            Channel::SendAck => "sub-ack",
            Channel::Errors => "sub-errors",
            Channel::Pong => "sub-pong",
        }
    }

    pub fn from_subscription_id(id: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.subscription_id() == id)
    }

    pub fn from_destination(meeting_id: u64, destination: &str) -> Option<Channel> {
        Channel::ALL
            .into_iter()
            .find(|c| c.destination(meeting_id) == destination)
    }
}

/// Where outgoing chat messages for a meeting are published.
pub fn publish_destination(meeting_id: u64) -> String {
    format!("/app/meetings/{meeting_id}/messages")
}

/// A decoded server push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    MessageCreated(ChatMessage),
    UnreadCountUpdated(Vec<UnreadCount>),
    SendAck(SendAck),
    ServerError(ServerErrorBody),
    Pong,
}

#[derive(Debug, Error)]
#[error("malformed {channel:?} payload: {source}")]
pub struct EventDecodeError {
    pub channel: Channel,
    #[source]
    pub source: serde_json::Error,
}

fn parse<T: DeserializeOwned>(channel: Channel, body: &str) -> Result<T, EventDecodeError> {
    serde_json::from_str(body).map_err(|source| EventDecodeError { channel, source })
}

/// Decode a MESSAGE body according to the channel it arrived on.
pub fn decode_event(channel: Channel, body: &str) -> Result<ChatEvent, EventDecodeError> {
    Ok(match channel {
        Channel::Messages => ChatEvent::MessageCreated(parse(channel, body)?),
        Channel::UnreadCounts => {
            // The server sends either `{"updates":[..]}` or a bare array.
            let trimmed = body.trim_start();
            let updates = if trimmed.starts_with('[') {
                parse::<Vec<UnreadCount>>(channel, body)?
            } else {
                parse::<UnreadCountUpdate>(channel, body)?.updates
            };
            ChatEvent::UnreadCountUpdated(updates)
        }
        Channel::SendAck => ChatEvent::SendAck(parse(channel, body)?),
        Channel::Errors => ChatEvent::ServerError(parse(channel, body)?),
        Channel::Pong => ChatEvent::Pong,
    })
}
