/// Relationships (likes, follows, views), user profiles and notifications
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Counter, NotificationId, PostId, UserId, UserSummary, ViewId};

/// A like is keyed by (actor, post); at most one exists per pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    pub user_id: UserId,
    pub post_id: PostId,
}

/// A follow edge keyed by (follower, followed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follow {
    pub follower_id: UserId,
    pub followed_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ViewId>,
    pub post_id: PostId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCounts {
    #[serde(default)]
    pub followers: Counter,
    #[serde(default)]
    pub following: Counter,
    #[serde(default)]
    pub posts: Counter,
}

/// Directory entry for a user, as listed on explore and follower pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudoname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(rename = "_count", default)]
    pub counts: ProfileCounts,

    /// Whether the local actor follows this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<bool>,
}

impl UserProfile {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            username: None,
            pseudoname: None,
            display_name: None,
            avatar_url: None,
            counts: ProfileCounts::default(),
            following: None,
        }
    }

    pub fn is_followed(&self) -> bool {
        self.following.unwrap_or(false)
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            username: self.username.clone(),
            pseudoname: self.pseudoname.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }

    pub fn merge_from(&mut self, incoming: UserProfile) {
        if incoming.username.is_some() {
            self.username = incoming.username;
        }
        if incoming.pseudoname.is_some() {
            self.pseudoname = incoming.pseudoname;
        }
        if incoming.display_name.is_some() {
            self.display_name = incoming.display_name;
        }
        if incoming.avatar_url.is_some() {
            self.avatar_url = incoming.avatar_url;
        }
        if incoming.following.is_some() {
            self.following = incoming.following;
        }
        self.counts
            .followers
            .reset_confirmed(incoming.counts.followers.confirmed());
        self.counts
            .following
            .reset_confirmed(incoming.counts.following.confirmed());
        self.counts
            .posts
            .reset_confirmed(incoming.counts.posts.confirmed());
    }
}

impl From<UserSummary> for UserProfile {
    fn from(summary: UserSummary) -> Self {
        Self {
            id: summary.id,
            username: summary.username,
            pseudoname: summary.pseudoname,
            display_name: summary.display_name,
            avatar_url: summary.avatar_url,
            counts: ProfileCounts::default(),
            following: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "NEW_LIKE")]
    NewLike,
    #[serde(rename = "NEW_COMMENT")]
    NewComment,
    #[serde(rename = "NEW_FOLLOW")]
    NewFollow,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NotificationId>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Id used for de-duplication; older payloads only carry it under `data.id`.
    pub fn dedup_id(&self) -> Option<String> {
        self.id
            .as_ref()
            .map(|id| id.0.clone())
            .or_else(|| {
                self.data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
    }
}
