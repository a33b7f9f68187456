/// Action gateway
/// The single authority on whether a state change happened. Every mutation
/// is one request; nothing here retries on its own or touches local state.
use async_trait::async_trait;
use feed_model::{validate_content, Comment, CommentId, Post, PostId, UserId, UserProfile, View};
use serde::{Deserialize, Serialize};

use crate::{FeedError, PageCursor, Result};

/// Body of a post create/update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDraft {
    pub content: String,
    #[serde(default)]
    pub image_urls: Vec<feed_model::ImageRef>,
}

impl PostDraft {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image_urls: Vec::new(),
        }
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_urls.push(feed_model::ImageRef { url: url.into() });
        self
    }

    /// Trimmed copy, or a validation error for blank/oversized content.
    pub fn validated(&self) -> Result<PostDraft> {
        let content = validate_content(&self.content)?;
        if self.image_urls.iter().any(|image| image.url.trim().is_empty()) {
            return Err(FeedError::ValidationError(
                "image url must not be empty".to_string(),
            ));
        }
        Ok(PostDraft {
            content: content.to_string(),
            image_urls: self.image_urls.clone(),
        })
    }
}

#[async_trait]
pub trait ActionGateway: Send + Sync {
    async fn list_posts(&self, cursor: PageCursor) -> Result<Vec<Post>>;
    async fn get_post(&self, post_id: &PostId) -> Result<Post>;
    async fn create_post(&self, draft: &PostDraft) -> Result<Post>;
    async fn update_post(&self, post_id: &PostId, draft: &PostDraft) -> Result<Post>;
    async fn delete_post(&self, post_id: &PostId) -> Result<()>;

    /// Returns the server's like state after the toggle.
    async fn toggle_like(&self, post_id: &PostId) -> Result<bool>;
    async fn check_liked(&self, post_id: &PostId) -> Result<bool>;

    /// Returns the server's follow state after the toggle.
    async fn toggle_follow(&self, user_id: &UserId) -> Result<bool>;
    async fn check_following(&self, user_id: &UserId) -> Result<bool>;

    async fn list_users(&self, cursor: PageCursor) -> Result<Vec<UserProfile>>;
    async fn list_followers(&self, user_id: &UserId, cursor: PageCursor)
        -> Result<Vec<UserProfile>>;

    async fn list_comments(&self, post_id: &PostId, cursor: PageCursor) -> Result<Vec<Comment>>;
    async fn create_comment(&self, post_id: &PostId, content: &str) -> Result<Comment>;
    async fn update_comment(&self, comment_id: &CommentId, content: &str) -> Result<Comment>;
    async fn delete_comment(&self, comment_id: &CommentId) -> Result<()>;

    async fn create_view(&self, post_id: &PostId) -> Result<View>;
    async fn check_viewed(&self, post_id: &PostId) -> Result<bool>;
}
