/// HTTP implementation of the action gateway
use async_trait::async_trait;
use feed_model::{
    validate_content, Comment, CommentId, Post, PostId, UserId, UserProfile, UserSummary, View,
};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    ActionGateway, FeedConfig, FeedError, PageCursor, PostDraft, Result, SessionStore,
    SessionTokens,
};

/// Tokens and profile returned by login and register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserSummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshedTokens {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct LikedBody {
    liked: bool,
}

#[derive(Debug, Deserialize)]
struct FollowingBody {
    following: bool,
}

#[derive(Debug, Deserialize)]
struct ViewedBody {
    viewed: bool,
}

/// List endpoints answer either a bare array or an object wrapping it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Data { data: Vec<T> },
    Users { users: Vec<T> },
    Bare(Vec<T>),
}

impl<T> Listing<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            Listing::Data { data } => data,
            Listing::Users { users } => users,
            Listing::Bare(items) => items,
        }
    }
}

pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
    session: SessionStore,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl HttpGateway {
    pub fn new(config: &FeedConfig, session: SessionStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("feed-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FeedError::NetworkError(e.to_string()))?;

        Ok(Self {
            base_url: config.api_base().to_string(),
            client,
            session,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.session.load(), Ok(Some(_)))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AuthSession> {
        let body = json!({ "username": username, "password": password });
        self.authenticate("/auth/login", body).await
    }

    pub async fn register(
        &self,
        username: &str,
        pseudoname: Option<&str>,
        password: &str,
    ) -> Result<AuthSession> {
        let mut body = json!({ "username": username, "password": password });
        if let Some(pseudoname) = pseudoname {
            body["pseudoname"] = json!(pseudoname);
        }
        self.authenticate("/auth/register", body).await
    }

    pub fn logout(&self) -> Result<()> {
        info!("Logging out");
        self.session.clear()
    }

    pub async fn current_user(&self) -> Result<UserSummary> {
        self.get_json("/users/me", &[]).await
    }

    async fn authenticate(&self, path: &str, body: Value) -> Result<AuthSession> {
        let response = self.send_once(Method::POST, path, &[], Some(&body), None).await?;
        let auth: AuthSession = decode(check_status(response).await?).await?;

        self.session.save(&SessionTokens {
            access_token: auth.access_token.clone(),
            refresh_token: auth.refresh_token.clone(),
            user: Some(auth.user.clone()),
        })?;
        info!("Authenticated as {}", auth.user.id);
        Ok(auth)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Response> {
        debug!("{} {}", method, path);

        let mut request = self.client.request(method, self.url(path));
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        request
            .send()
            .await
            .map_err(|e| FeedError::NetworkError(e.to_string()))
    }

    /// Authenticated request. An auth failure triggers exactly one token
    /// refresh and retry; a second failure clears the stored session.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Response> {
        let token = self.session.access_token();
        let response = self
            .send_once(method.clone(), path, query, body.as_ref(), token.as_deref())
            .await?;

        if !is_auth_failure(response.status()) {
            return check_status(response).await;
        }

        debug!("{} {} answered {}; refreshing session", method, path, response.status());
        let fresh = match self.refresh_tokens(token.as_deref()).await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.drop_session();
                return Err(e);
            }
        };

        let retry = self
            .send_once(method, path, query, body.as_ref(), Some(&fresh))
            .await?;
        if is_auth_failure(retry.status()) {
            self.drop_session();
        }
        check_status(retry).await
    }

    async fn refresh_tokens(&self, stale: Option<&str>) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        let current = self
            .session
            .load()?
            .ok_or_else(|| FeedError::AuthError("not logged in".to_string()))?;

        // Another request refreshed while we waited.
        if stale.is_some() && stale != Some(current.access_token.as_str()) {
            return Ok(current.access_token);
        }

        let body = json!({ "refreshToken": current.refresh_token });
        let response = self
            .send_once(Method::POST, "/auth/refresh", &[], Some(&body), None)
            .await?;
        if !response.status().is_success() {
            return Err(FeedError::AuthError(format!(
                "session refresh rejected ({})",
                response.status()
            )));
        }

        let refreshed: RefreshedTokens = decode(response).await?;
        self.session.save(&SessionTokens {
            access_token: refreshed.access_token.clone(),
            refresh_token: refreshed.refresh_token,
            user: current.user,
        })?;
        info!("Session refreshed");
        Ok(refreshed.access_token)
    }

    fn drop_session(&self) {
        warn!("Session expired; clearing stored credentials");
        if let Err(e) = self.session.clear() {
            warn!("Failed to clear session: {}", e);
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self.execute(Method::GET, path, query, None).await?;
        decode(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, method: Method, path: &str, body: Value) -> Result<T> {
        let response = self.execute(method, path, &[], Some(body)).await?;
        decode(response).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.execute(Method::DELETE, path, &[], None).await?;
        Ok(())
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn paging(cursor: PageCursor) -> [(&'static str, String); 2] {
    [
        ("limit", cursor.limit.to_string()),
        ("offset", cursor.offset.to_string()),
    ]
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| FeedError::NetworkError(e.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, error_message(&body, status)))
}

/// `message` or `error` from a JSON error body, else the raw body.
fn error_message(body: &str, status: StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error"] {
            if let Some(message) = value.get(key).and_then(Value::as_str) {
                return message.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}

fn status_error(status: StatusCode, message: String) -> FeedError {
    match status.as_u16() {
        401 | 403 => FeedError::AuthError(message),
        400 | 409 | 422 => FeedError::ValidationError(message),
        404 => FeedError::NotFound(message),
        code => FeedError::ServerError {
            status: code,
            message,
        },
    }
}

#[async_trait]
impl ActionGateway for HttpGateway {
    async fn list_posts(&self, cursor: PageCursor) -> Result<Vec<Post>> {
        let listing: Listing<Post> = self.get_json("/posts", &paging(cursor)).await?;
        Ok(listing.into_items())
    }

    async fn get_post(&self, post_id: &PostId) -> Result<Post> {
        self.get_json(&format!("/posts/{}", post_id), &[]).await
    }

    async fn create_post(&self, draft: &PostDraft) -> Result<Post> {
        let draft = draft.validated()?;
        self.send_json(Method::POST, "/posts", serde_json::to_value(&draft)?)
            .await
    }

    async fn update_post(&self, post_id: &PostId, draft: &PostDraft) -> Result<Post> {
        let draft = draft.validated()?;
        self.send_json(
            Method::PUT,
            &format!("/posts/{}", post_id),
            serde_json::to_value(&draft)?,
        )
        .await
    }

    async fn delete_post(&self, post_id: &PostId) -> Result<()> {
        self.delete(&format!("/posts/{}", post_id)).await
    }

    async fn toggle_like(&self, post_id: &PostId) -> Result<bool> {
        let body: LikedBody = self
            .send_json(Method::POST, &format!("/likes/toggle/{}", post_id), json!({}))
            .await?;
        Ok(body.liked)
    }

    async fn check_liked(&self, post_id: &PostId) -> Result<bool> {
        let body: LikedBody = self
            .get_json(&format!("/likes/check/{}", post_id), &[])
            .await?;
        Ok(body.liked)
    }

    async fn toggle_follow(&self, user_id: &UserId) -> Result<bool> {
        let body: FollowingBody = self
            .send_json(Method::POST, &format!("/followers/toggle/{}", user_id), json!({}))
            .await?;
        Ok(body.following)
    }

    async fn check_following(&self, user_id: &UserId) -> Result<bool> {
        let body: FollowingBody = self
            .get_json(&format!("/followers/check/{}", user_id), &[])
            .await?;
        Ok(body.following)
    }

    async fn list_users(&self, cursor: PageCursor) -> Result<Vec<UserProfile>> {
        let listing: Listing<UserProfile> = self.get_json("/users", &paging(cursor)).await?;
        Ok(listing.into_items())
    }

    async fn list_followers(
        &self,
        user_id: &UserId,
        cursor: PageCursor,
    ) -> Result<Vec<UserProfile>> {
        let listing: Listing<UserProfile> = self
            .get_json(&format!("/followers/followers/{}", user_id), &paging(cursor))
            .await?;
        Ok(listing.into_items())
    }

    async fn list_comments(&self, post_id: &PostId, cursor: PageCursor) -> Result<Vec<Comment>> {
        let [limit, offset] = paging(cursor);
        let query = [("postId", post_id.to_string()), limit, offset];
        let listing: Listing<Comment> = self.get_json("/comments", &query).await?;
        Ok(listing.into_items())
    }

    async fn create_comment(&self, post_id: &PostId, content: &str) -> Result<Comment> {
        let content = validate_content(content)?;
        self.send_json(
            Method::POST,
            "/comments",
            json!({ "postId": post_id, "content": content }),
        )
        .await
    }

    async fn update_comment(&self, comment_id: &CommentId, content: &str) -> Result<Comment> {
        let content = validate_content(content)?;
        self.send_json(
            Method::PUT,
            &format!("/comments/{}", comment_id),
            json!({ "content": content }),
        )
        .await
    }

    async fn delete_comment(&self, comment_id: &CommentId) -> Result<()> {
        self.delete(&format!("/comments/{}", comment_id)).await
    }

    async fn create_view(&self, post_id: &PostId) -> Result<View> {
        self.send_json(Method::POST, "/views", json!({ "postId": post_id }))
            .await
    }

    async fn check_viewed(&self, post_id: &PostId) -> Result<bool> {
        let body: ViewedBody = self
            .get_json(&format!("/views/check/{}", post_id), &[])
            .await?;
        Ok(body.viewed)
    }
}
