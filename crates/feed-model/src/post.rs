use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommentId, Counter, PostId, UserId};

/// Author information embedded in posts and comments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudoname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserSummary {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            username: None,
            pseudoname: None,
            display_name: None,
            avatar_url: None,
        }
    }

    /// Name shown next to content and in typing indicators.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.pseudoname.as_deref())
            .or(self.username.as_deref())
            .unwrap_or("User")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

/// Aggregate counters the backend attaches to a post as `_count`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCounts {
    #[serde(default)]
    pub likes: Counter,
    #[serde(default)]
    pub comments: Counter,
    #[serde(default)]
    pub views: Counter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_urls: Vec<ImageRef>,
    #[serde(rename = "_count", default)]
    pub counts: PostCounts,

    /// Whether the local actor likes this post. Not part of every payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liked: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Post {
    pub fn new(id: PostId, content: impl Into<String>) -> Self {
        Self {
            id,
            user_id: None,
            user: None,
            content: content.into(),
            image_urls: Vec::new(),
            counts: PostCounts::default(),
            liked: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn author_id(&self) -> Option<&UserId> {
        self.user_id
            .as_ref()
            .or_else(|| self.user.as_ref().map(|u| &u.id))
    }

    pub fn is_liked(&self) -> bool {
        self.liked.unwrap_or(false)
    }

    /// Last-writer-wins merge of a fresher server copy. Counters take the
    /// server value as their new confirmed base; outstanding predictions
    /// stay on top. Fields the payload omits are kept.
    pub fn merge_from(&mut self, incoming: Post) {
        self.content = incoming.content;
        self.image_urls = incoming.image_urls;
        if incoming.user_id.is_some() {
            self.user_id = incoming.user_id;
        }
        if incoming.user.is_some() {
            self.user = incoming.user;
        }
        if incoming.liked.is_some() {
            self.liked = incoming.liked;
        }
        if incoming.created_at.is_some() {
            self.created_at = incoming.created_at;
        }
        if incoming.updated_at.is_some() {
            self.updated_at = incoming.updated_at;
        }
        self.counts
            .likes
            .reset_confirmed(incoming.counts.likes.confirmed());
        self.counts
            .comments
            .reset_confirmed(incoming.counts.comments.confirmed());
        self.counts
            .views
            .reset_confirmed(incoming.counts.views.confirmed());
    }

    /// Apply an edit notification. Edits carry no trustworthy counters, so
    /// only authored fields are taken.
    pub fn apply_edit(&mut self, edited: &Post) {
        self.content = edited.content.clone();
        self.image_urls = edited.image_urls.clone();
        if edited.updated_at.is_some() {
            self.updated_at = edited.updated_at;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn new(id: CommentId, post_id: PostId, content: impl Into<String>) -> Self {
        Self {
            id,
            post_id,
            user_id: None,
            user: None,
            content: content.into(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn author_id(&self) -> Option<&UserId> {
        self.user_id
            .as_ref()
            .or_else(|| self.user.as_ref().map(|u| &u.id))
    }

    pub fn merge_from(&mut self, incoming: Comment) {
        self.content = incoming.content;
        if incoming.user_id.is_some() {
            self.user_id = incoming.user_id;
        }
        if incoming.user.is_some() {
            self.user = incoming.user;
        }
        if incoming.created_at.is_some() {
            self.created_at = incoming.created_at;
        }
        if incoming.updated_at.is_some() {
            self.updated_at = incoming.updated_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_backend_post_shape() {
        let post: Post = serde_json::from_value(json!({
            "id": "p1",
            "userId": "u1",
            "content": "hello",
            "imageUrls": [{ "url": "https://cdn/x.png" }],
            "_count": { "likes": 5, "comments": 2, "views": 9 },
            "createdAt": "2024-05-01T10:00:00Z",
            "user": { "id": "u1", "pseudoname": "ann" }
        }))
        .unwrap();

        assert_eq!(post.counts.likes.value(), 5);
        assert_eq!(post.counts.views.value(), 9);
        assert_eq!(post.author_id(), Some(&UserId::from("u1")));
        assert_eq!(post.user.as_ref().unwrap().label(), "ann");
        assert!(!post.is_liked());
    }

    #[test]
    fn missing_counts_default_to_zero() {
        let post: Post = serde_json::from_value(json!({ "id": "p1" })).unwrap();
        assert_eq!(post.counts, PostCounts::default());
        assert!(post.content.is_empty());
    }

    #[test]
    fn merge_keeps_pending_predictions() {
        let mut local = Post::new(PostId::from("p1"), "old");
        local.counts.likes = Counter::new(5);
        local.liked = Some(true);
        local.counts.likes.predict(1);

        let mut incoming = Post::new(PostId::from("p1"), "new");
        incoming.counts.likes = Counter::new(10);
        local.merge_from(incoming);

        assert_eq!(local.content, "new");
        assert_eq!(local.counts.likes.value(), 11);
        assert_eq!(local.liked, Some(true));
    }

    #[test]
    fn edit_leaves_counters_alone() {
        let mut local = Post::new(PostId::from("p1"), "old");
        local.counts.likes = Counter::new(7);

        let edited: Post =
            serde_json::from_value(json!({ "id": "p1", "content": "fixed typo" })).unwrap();
        local.apply_edit(&edited);

        assert_eq!(local.content, "fixed typo");
        assert_eq!(local.counts.likes.value(), 7);
    }

    #[test]
    fn comment_author_falls_back_to_embedded_user() {
        let comment: Comment = serde_json::from_value(json!({
            "id": "c1",
            "postId": "p1",
            "content": "nice",
            "user": { "id": "u9", "displayName": "Nine" }
        }))
        .unwrap();
        assert_eq!(comment.author_id(), Some(&UserId::from("u9")));
    }
}
