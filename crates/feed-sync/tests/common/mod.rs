#![allow(dead_code)]
//! In-memory backend used by the session tests
use async_trait::async_trait;
use feed_sync::feed_model::{
    Comment, CommentId, Counter, Post, PostId, UserId, UserProfile, UserSummary, View,
};
use feed_sync::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
pub struct Backend {
    pub posts: Vec<Post>,
    pub users: Vec<UserProfile>,
    pub comments: Vec<Comment>,
    pub liked: HashSet<PostId>,
    pub following: HashSet<UserId>,
    pub viewed: HashSet<PostId>,
    pub broken_checks: HashSet<PostId>,
    pub calls: Vec<String>,
    pub fail_status: Option<u16>,
}

#[derive(Default)]
pub struct MockGateway {
    pub backend: Mutex<Backend>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockGateway {
    pub fn with_posts(posts: Vec<Post>) -> Self {
        let gateway = Self::default();
        gateway.backend.lock().posts = posts;
        gateway
    }

    /// The next gateway call fails with `status`.
    pub fn fail_next(&self, status: u16) {
        self.backend.lock().fail_status = Some(status);
    }

    /// The next gateway call blocks until the returned handle is notified.
    pub fn hold_next(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self, prefix: &str) -> usize {
        self.backend
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    async fn enter(&self, call: String) -> Result<()> {
        self.backend.lock().calls.push(call);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(status) = self.backend.lock().fail_status.take() {
            return Err(FeedError::ServerError {
                status,
                message: "backend unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ActionGateway for MockGateway {
    async fn list_posts(&self, cursor: PageCursor) -> Result<Vec<Post>> {
        self.enter(format!("list_posts {}", cursor.offset)).await?;
        let backend = self.backend.lock();
        Ok(backend
            .posts
            .iter()
            .skip(cursor.offset)
            .take(cursor.limit)
            .cloned()
            .collect())
    }

    async fn get_post(&self, post_id: &PostId) -> Result<Post> {
        self.enter(format!("get_post {post_id}")).await?;
        self.backend
            .lock()
            .posts
            .iter()
            .find(|p| p.id == *post_id)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(post_id.to_string()))
    }

    async fn create_post(&self, draft: &PostDraft) -> Result<Post> {
        self.enter("create_post".to_string()).await?;
        let mut post = Post::new(PostId::new(), draft.content.clone());
        post.image_urls = draft.image_urls.clone();
        self.backend.lock().posts.insert(0, post.clone());
        Ok(post)
    }

    async fn update_post(&self, post_id: &PostId, draft: &PostDraft) -> Result<Post> {
        self.enter(format!("update_post {post_id}")).await?;
        let mut backend = self.backend.lock();
        let post = backend
            .posts
            .iter_mut()
            .find(|p| p.id == *post_id)
            .ok_or_else(|| FeedError::NotFound(post_id.to_string()))?;
        post.content = draft.content.clone();
        Ok(post.clone())
    }

    async fn delete_post(&self, post_id: &PostId) -> Result<()> {
        self.enter(format!("delete_post {post_id}")).await?;
        self.backend.lock().posts.retain(|p| p.id != *post_id);
        Ok(())
    }

    async fn toggle_like(&self, post_id: &PostId) -> Result<bool> {
        self.enter(format!("toggle_like {post_id}")).await?;
        let mut backend = self.backend.lock();
        let liked = !backend.liked.remove(post_id);
        if liked {
            backend.liked.insert(post_id.clone());
        }
        if let Some(post) = backend.posts.iter_mut().find(|p| p.id == *post_id) {
            let likes = post.counts.likes.value();
            post.counts.likes = Counter::new(if liked { likes + 1 } else { likes.saturating_sub(1) });
        }
        Ok(liked)
    }

    async fn check_liked(&self, post_id: &PostId) -> Result<bool> {
        self.enter(format!("check_liked {post_id}")).await?;
        let backend = self.backend.lock();
        if backend.broken_checks.contains(post_id) {
            return Err(FeedError::NetworkError("connection reset".to_string()));
        }
        Ok(backend.liked.contains(post_id))
    }

    async fn toggle_follow(&self, user_id: &UserId) -> Result<bool> {
        self.enter(format!("toggle_follow {user_id}")).await?;
        let mut backend = self.backend.lock();
        let following = !backend.following.remove(user_id);
        if following {
            backend.following.insert(user_id.clone());
        }
        Ok(following)
    }

    async fn check_following(&self, user_id: &UserId) -> Result<bool> {
        self.enter(format!("check_following {user_id}")).await?;
        Ok(self.backend.lock().following.contains(user_id))
    }

    async fn list_users(&self, cursor: PageCursor) -> Result<Vec<UserProfile>> {
        self.enter("list_users".to_string()).await?;
        let backend = self.backend.lock();
        Ok(backend
            .users
            .iter()
            .skip(cursor.offset)
            .take(cursor.limit)
            .cloned()
            .collect())
    }

    async fn list_followers(
        &self,
        user_id: &UserId,
        _cursor: PageCursor,
    ) -> Result<Vec<UserProfile>> {
        self.enter(format!("list_followers {user_id}")).await?;
        Ok(Vec::new())
    }

    async fn list_comments(&self, post_id: &PostId, cursor: PageCursor) -> Result<Vec<Comment>> {
        self.enter(format!("list_comments {post_id}")).await?;
        let backend = self.backend.lock();
        Ok(backend
            .comments
            .iter()
            .filter(|c| c.post_id == *post_id)
            .skip(cursor.offset)
            .take(cursor.limit)
            .cloned()
            .collect())
    }

    async fn create_comment(&self, post_id: &PostId, content: &str) -> Result<Comment> {
        self.enter(format!("create_comment {post_id}")).await?;
        let mut comment = Comment::new(CommentId::new(), post_id.clone(), content);
        comment.user_id = Some(me().id);
        self.backend.lock().comments.insert(0, comment.clone());
        Ok(comment)
    }

    async fn update_comment(&self, comment_id: &CommentId, content: &str) -> Result<Comment> {
        self.enter(format!("update_comment {comment_id}")).await?;
        let mut backend = self.backend.lock();
        let comment = backend
            .comments
            .iter_mut()
            .find(|c| c.id == *comment_id)
            .ok_or_else(|| FeedError::NotFound(comment_id.to_string()))?;
        comment.content = content.to_string();
        Ok(comment.clone())
    }

    async fn delete_comment(&self, comment_id: &CommentId) -> Result<()> {
        self.enter(format!("delete_comment {comment_id}")).await?;
        self.backend.lock().comments.retain(|c| c.id != *comment_id);
        Ok(())
    }

    async fn create_view(&self, post_id: &PostId) -> Result<View> {
        self.enter(format!("create_view {post_id}")).await?;
        self.backend.lock().viewed.insert(post_id.clone());
        Ok(View {
            id: None,
            post_id: post_id.clone(),
            user_id: Some(me().id),
            created_at: None,
        })
    }

    async fn check_viewed(&self, post_id: &PostId) -> Result<bool> {
        self.enter(format!("check_viewed {post_id}")).await?;
        Ok(self.backend.lock().viewed.contains(post_id))
    }
}

pub fn me() -> UserSummary {
    let mut actor = UserSummary::new(UserId::from("me"));
    actor.display_name = Some("Me".to_string());
    actor
}

pub fn post_with_likes(id: &str, likes: u64) -> Post {
    let mut post = Post::new(PostId::from(id), format!("post {id}"));
    post.counts.likes = Counter::new(likes);
    post
}

pub fn session_with(
    gateway: Arc<MockGateway>,
    storage: Arc<dyn KeyValueStore>,
) -> FeedSession {
    let config = FeedConfig::default();
    let channel = Arc::new(ChannelClient::new(ChannelConfig::from(&config)));
    FeedSession::new(config, me(), gateway, channel, storage)
}

pub fn session(gateway: Arc<MockGateway>) -> FeedSession {
    session_with(gateway, Arc::new(MemoryStore::new()))
}

pub fn frame(event: &str, data: serde_json::Value) -> BroadcastEvent {
    let text = serde_json::json!({ "event": event, "data": data }).to_string();
    match BroadcastEvent::decode(&text) {
        Ok(event) => event,
        Err(e) => panic!("bad test frame: {e}"),
    }
}

/// Let spawned tasks run until `done` holds.
pub async fn settle_until(done: impl Fn() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
