use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Media profile of a 1:1 call. Audio is always captured; video only for `Video`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn wants_video(self) -> bool {
        matches!(self, CallKind::Video)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RoomRole {
    Host,
    Viewer,
}

/// Presence value carried on the retained status topics (and the Last Will).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room: String,
    pub user: String,
    pub text: String,
    /// Locally generated; the dedupe key when the broker echoes our own publish back.
    pub id: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(room: impl Into<String>, user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            user: user.into(),
            text: text.into(),
            id: Uuid::new_v4().to_string(),
            sent_at: Utc::now(),
        }
    }
}

/// Point-to-point signaling bodies, carried on `user/{id}/signal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalBody {
    CallOffer { sdp: String, media: CallKind },
    CallAnswer { sdp: String },
    /// Hangup and decline share one body; the receiver reacts based on its own state.
    CallEnd,
    BroadcastOffer { sdp: String },
    BroadcastAnswer { sdp: String },
    Candidate { candidate: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub body: SignalBody,
}

/// Events on the shared `room/{id}/events` topic of one broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomEvent {
    Joined { id: String, role: RoomRole },
    Left { id: String },
    ViewerCount { count: u32 },
    Chat { message: ChatMessage },
    StreamEnded,
}
