/// Push channel event codec
/// Inbound frames are decoded exactly once, here, into a tagged union with a
/// fixed schema per event type. Nothing downstream sees raw JSON.
use chrono::{DateTime, Utc};
use feed_model::{
    Comment, CommentId, EventId, Like, Notification, Post, PostId, UserId, UserSummary,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{FeedError, Result};

/// Every event type the channel understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    PostCreated,
    PostUpdated,
    PostDeleted,
    LikeCreated,
    LikeRemoved,
    CommentCreated,
    CommentUpdated,
    CommentDeleted,
    CommentTyping,
    CommentStopTyping,
    ViewCreated,
    FollowerCreated,
    FollowRemoved,
    Notification,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        EventType::PostCreated,
        EventType::PostUpdated,
        EventType::PostDeleted,
        EventType::LikeCreated,
        EventType::LikeRemoved,
        EventType::CommentCreated,
        EventType::CommentUpdated,
        EventType::CommentDeleted,
        EventType::CommentTyping,
        EventType::CommentStopTyping,
        EventType::ViewCreated,
        EventType::FollowerCreated,
        EventType::FollowRemoved,
        EventType::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PostCreated => "post:created",
            EventType::PostUpdated => "post:updated",
            EventType::PostDeleted => "post:deleted",
            EventType::LikeCreated => "like:created",
            EventType::LikeRemoved => "like:removed",
            EventType::CommentCreated => "comment:created",
            EventType::CommentUpdated => "comment:updated",
            EventType::CommentDeleted => "comment:deleted",
            EventType::CommentTyping => "comment:typing",
            EventType::CommentStopTyping => "comment:stop-typing",
            EventType::ViewCreated => "view:created",
            EventType::FollowerCreated => "follower:created",
            EventType::FollowRemoved => "follow:removed",
            EventType::Notification => "notification",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// Presence signals are ephemeral and never reach reconciliation.
    pub fn is_presence(&self) -> bool {
        matches!(self, EventType::CommentTyping | EventType::CommentStopTyping)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDeleted {
    pub post_id: PostId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentDeleted {
    pub comment_id: CommentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<PostId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub post_id: PostId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewCreated {
    pub post_id: PostId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowEvent {
    pub follower_id: UserId,
    pub followed_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follower: Option<UserSummary>,
}

/// Decoded payload, one variant per event type
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    PostCreated(Post),
    PostUpdated(Post),
    PostDeleted(PostDeleted),
    LikeCreated(Like),
    LikeRemoved(Like),
    CommentCreated(Comment),
    CommentUpdated(Comment),
    CommentDeleted(CommentDeleted),
    CommentTyping(TypingSignal),
    CommentStopTyping(TypingSignal),
    ViewCreated(ViewCreated),
    FollowerCreated(FollowEvent),
    FollowRemoved(FollowEvent),
    Notification(Notification),
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::PostCreated(_) => EventType::PostCreated,
            EventKind::PostUpdated(_) => EventType::PostUpdated,
            EventKind::PostDeleted(_) => EventType::PostDeleted,
            EventKind::LikeCreated(_) => EventType::LikeCreated,
            EventKind::LikeRemoved(_) => EventType::LikeRemoved,
            EventKind::CommentCreated(_) => EventType::CommentCreated,
            EventKind::CommentUpdated(_) => EventType::CommentUpdated,
            EventKind::CommentDeleted(_) => EventType::CommentDeleted,
            EventKind::CommentTyping(_) => EventType::CommentTyping,
            EventKind::CommentStopTyping(_) => EventType::CommentStopTyping,
            EventKind::ViewCreated(_) => EventType::ViewCreated,
            EventKind::FollowerCreated(_) => EventType::FollowerCreated,
            EventKind::FollowRemoved(_) => EventType::FollowRemoved,
            EventKind::Notification(_) => EventType::Notification,
        }
    }

    fn decode(event_type: EventType, data: serde_json::Value) -> Result<Self> {
        use serde_json::from_value;

        let kind = match event_type {
            EventType::PostCreated => EventKind::PostCreated(from_value(data)?),
            EventType::PostUpdated => EventKind::PostUpdated(from_value(data)?),
            EventType::PostDeleted => EventKind::PostDeleted(from_value(data)?),
            EventType::LikeCreated => EventKind::LikeCreated(from_value(data)?),
            EventType::LikeRemoved => EventKind::LikeRemoved(from_value(data)?),
            EventType::CommentCreated => EventKind::CommentCreated(from_value(data)?),
            EventType::CommentUpdated => EventKind::CommentUpdated(from_value(data)?),
            EventType::CommentDeleted => EventKind::CommentDeleted(from_value(data)?),
            EventType::CommentTyping => EventKind::CommentTyping(from_value(data)?),
            EventType::CommentStopTyping => EventKind::CommentStopTyping(from_value(data)?),
            EventType::ViewCreated => EventKind::ViewCreated(from_value(data)?),
            EventType::FollowerCreated => EventKind::FollowerCreated(from_value(data)?),
            EventType::FollowRemoved => EventKind::FollowRemoved(from_value(data)?),
            EventType::Notification => EventKind::Notification(from_value(data)?),
        };
        Ok(kind)
    }

    fn payload(&self) -> Result<serde_json::Value> {
        use serde_json::to_value;

        let value = match self {
            EventKind::PostCreated(p) | EventKind::PostUpdated(p) => to_value(p)?,
            EventKind::PostDeleted(p) => to_value(p)?,
            EventKind::LikeCreated(l) | EventKind::LikeRemoved(l) => to_value(l)?,
            EventKind::CommentCreated(c) | EventKind::CommentUpdated(c) => to_value(c)?,
            EventKind::CommentDeleted(c) => to_value(c)?,
            EventKind::CommentTyping(t) | EventKind::CommentStopTyping(t) => to_value(t)?,
            EventKind::ViewCreated(v) => to_value(v)?,
            EventKind::FollowerCreated(f) | EventKind::FollowRemoved(f) => to_value(f)?,
            EventKind::Notification(n) => to_value(n)?,
        };
        Ok(value)
    }
}

/// JSON text frame as it travels over the socket
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    data: serde_json::Value,
}

/// An inbound broadcast: stateless input to reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub id: Option<EventId>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub kind: EventKind,
}

impl BroadcastEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: None,
            server_timestamp: None,
            kind,
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.server_timestamp = Some(at);
        self
    }

    /// Decode one text frame. Unknown event types and payloads that do not
    /// match their schema are errors; callers log and drop them.
    pub fn decode(text: &str) -> Result<Self> {
        let frame: WireFrame = serde_json::from_str(text)?;
        let event_type = EventType::parse(&frame.event).ok_or_else(|| {
            FeedError::SerializationError(format!("unknown event type: {}", frame.event))
        })?;
        let kind = EventKind::decode(event_type, frame.data).map_err(|e| {
            FeedError::SerializationError(format!("malformed {} payload: {}", event_type, e))
        })?;

        Ok(Self {
            id: frame.id,
            server_timestamp: frame.timestamp,
            kind,
        })
    }

    pub fn encode(&self) -> Result<String> {
        let frame = WireFrame {
            event: self.event_type().as_str().to_string(),
            id: self.id.clone(),
            timestamp: self.server_timestamp,
            data: self.kind.payload()?,
        };
        Ok(serde_json::to_string(&frame)?)
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// The actor whose action this event describes, when the payload says.
    pub fn actor(&self) -> Option<&UserId> {
        match &self.kind {
            EventKind::PostCreated(p) | EventKind::PostUpdated(p) => p.author_id(),
            EventKind::PostDeleted(p) => p.user_id.as_ref(),
            EventKind::LikeCreated(l) | EventKind::LikeRemoved(l) => Some(&l.user_id),
            EventKind::CommentCreated(c) | EventKind::CommentUpdated(c) => c.author_id(),
            EventKind::CommentDeleted(c) => c.user_id.as_ref(),
            EventKind::CommentTyping(t) | EventKind::CommentStopTyping(t) => t.user_id.as_ref(),
            EventKind::ViewCreated(v) => Some(&v.user_id),
            EventKind::FollowerCreated(f) | EventKind::FollowRemoved(f) => Some(&f.follower_id),
            EventKind::Notification(_) => None,
        }
    }

    /// Id of the entity the event is about.
    pub fn target(&self) -> String {
        match &self.kind {
            EventKind::PostCreated(p) | EventKind::PostUpdated(p) => p.id.to_string(),
            EventKind::PostDeleted(p) => p.post_id.to_string(),
            EventKind::LikeCreated(l) | EventKind::LikeRemoved(l) => l.post_id.to_string(),
            EventKind::CommentCreated(c) | EventKind::CommentUpdated(c) => c.id.to_string(),
            EventKind::CommentDeleted(c) => c.comment_id.to_string(),
            EventKind::CommentTyping(t) | EventKind::CommentStopTyping(t) => t.post_id.to_string(),
            EventKind::ViewCreated(v) => v.post_id.to_string(),
            EventKind::FollowerCreated(f) | EventKind::FollowRemoved(f) => {
                f.followed_id.to_string()
            }
            EventKind::Notification(n) => n.dedup_id().unwrap_or_default(),
        }
    }

    /// Key under which a foreign event is applied at most once: the server
    /// event id when present, otherwise type, actor, target and timestamp.
    pub fn dedup_key(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(id.to_string());
        }
        let at = self.server_timestamp?;
        let actor = self.actor().map(|a| a.as_str()).unwrap_or("-");
        Some(format!(
            "{}:{}:{}:{}",
            self.event_type(),
            actor,
            self.target(),
            at.timestamp_millis()
        ))
    }
}

/// Outbound fire-and-forget messages. Only presence travels upstream on the
/// channel; every state change goes through the action gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    Typing(TypingSignal),
    StopTyping(TypingSignal),
}

impl ClientSignal {
    pub fn event_type(&self) -> EventType {
        match self {
            ClientSignal::Typing(_) => EventType::CommentTyping,
            ClientSignal::StopTyping(_) => EventType::CommentStopTyping,
        }
    }

    pub fn signal(&self) -> &TypingSignal {
        match self {
            ClientSignal::Typing(s) | ClientSignal::StopTyping(s) => s,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let frame = WireFrame {
            event: self.event_type().as_str().to_string(),
            id: None,
            timestamp: None,
            data: serde_json::to_value(self.signal())?,
        };
        Ok(serde_json::to_string(&frame)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let frame: WireFrame = serde_json::from_str(text)?;
        let signal: TypingSignal = serde_json::from_value(frame.data)?;
        match EventType::parse(&frame.event) {
            Some(EventType::CommentTyping) => Ok(ClientSignal::Typing(signal)),
            Some(EventType::CommentStopTyping) => Ok(ClientSignal::StopTyping(signal)),
            _ => Err(FeedError::SerializationError(format!(
                "not a client signal: {}",
                frame.event
            ))),
        }
    }
}
