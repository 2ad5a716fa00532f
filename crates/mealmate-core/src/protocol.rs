// Wire types exchanged with the mealmate server.
//
// REST payloads (inside the `{ message, data, detail }` envelope) and the
// JSON bodies carried by the real-time channel. Everything here is parsed
// strictly: unknown enum values are decode errors rather than silently
// accepted shapes.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Server-side account lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    /// Signed up, terms not yet accepted.
    Pending,
    /// Terms accepted, food preferences not yet saved.
    Onboarding,
    Active,
    Deleted,
}

/// The signed-in user's profile as returned by `GET /api/users/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: u64,
    pub nickname: String,
    pub account_status: AccountStatus,
}

/// A terms document the user must (or may) consent to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agreement {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConsentRequest<'a> {
    pub agreement_ids: &'a [u64],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PreferenceRequest<'a> {
    pub choice_ids: &'a [u64],
}

// ---------------------------------------------------------------------------
// Meetings
// ---------------------------------------------------------------------------

/// Coarse workflow phase of a meeting, used to pace live-state polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeetingPhase {
    Recruiting,
    Voting,
    Confirmed,
    Settling,
    Completed,
    Cancelled,
}

/// Snapshot returned by `GET /api/meetings/{id}/state`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingLiveState {
    pub phase: MeetingPhase,
    #[serde(default)]
    pub participant_count: Option<u32>,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Image,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    pub id: u64,
    pub name: String,
    #[serde(rename = "profileImageUrl", default)]
    pub avatar_url: Option<String>,
}

/// A chat message. `id` is assigned by the server and is monotonic per
/// meeting, so it doubles as the ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "content")]
    pub body: String,
    #[serde(default)]
    pub sender: Option<MessageSender>,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub unread_count: Option<u32>,
}

/// One backward-paginated window of messages, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub next_cursor: Option<u64>,
    #[serde(default)]
    pub has_next: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub message_id: u64,
    pub unread_count: u32,
}

/// Body of the unread-count topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountUpdate {
    pub updates: Vec<UnreadCount>,
}

/// Body of the send-acknowledgement queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub client_message_id: String,
    #[serde(default)]
    pub message_id: Option<u64>,
}

/// Body of the user error queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Body published to the meeting's message destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Idempotency key; the server drops repeats of the same key.
    pub client_message_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReadCursorRequest {
    pub last_read_message_id: u64,
}
