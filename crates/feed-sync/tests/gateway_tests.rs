/// HTTP gateway against an in-process backend
/// Covers auth refresh-and-retry, status mapping and the wire shapes.
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use feed_sync::feed_model::PostId;
use feed_sync::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type ApiResult = std::result::Result<Json<Value>, (StatusCode, Json<Value>)>;

struct MockApi {
    valid_access: Mutex<String>,
    valid_refresh: Mutex<String>,
    refresh_allowed: bool,
    refresh_calls: AtomicUsize,
}

impl MockApi {
    fn authorize(&self, headers: &HeaderMap) -> std::result::Result<(), (StatusCode, Json<Value>)> {
        let expected = format!("Bearer {}", self.valid_access.lock());
        match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some(value) if value == expected => Ok(()),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "message": "Token expired" })),
            )),
        }
    }
}

async fn login(Json(body): Json<Value>) -> ApiResult {
    if body["username"] == "ann" && body["password"] == "pw" {
        Ok(Json(json!({
            "accessToken": "a1",
            "refreshToken": "r1",
            "user": { "id": "u1", "username": "ann" }
        })))
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Invalid credentials" })),
        ))
    }
}

async fn refresh(State(api): State<Arc<MockApi>>, Json(body): Json<Value>) -> ApiResult {
    api.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let presented = body["refreshToken"].as_str().unwrap_or_default().to_string();
    if !api.refresh_allowed || presented != *api.valid_refresh.lock() {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Refresh token revoked" })),
        ));
    }
    *api.valid_access.lock() = "a2".to_string();
    *api.valid_refresh.lock() = "r2".to_string();
    Ok(Json(json!({ "accessToken": "a2", "refreshToken": "r2" })))
}

async fn toggle_like(
    State(api): State<Arc<MockApi>>,
    headers: HeaderMap,
    Path(post_id): Path<String>,
) -> ApiResult {
    api.authorize(&headers)?;
    Ok(Json(json!({ "liked": post_id == "p1" })))
}

async fn list_posts(
    State(api): State<Arc<MockApi>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult {
    api.authorize(&headers)?;
    let offset: usize = query.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit: usize = query.get("limit").and_then(|v| v.parse().ok()).unwrap_or(10);
    let posts: Vec<Value> = (offset..offset + limit.min(3))
        .map(|i| json!({ "id": format!("p{i}"), "content": "x", "_count": { "likes": i } }))
        .collect();
    Ok(Json(json!({ "data": posts })))
}

async fn get_post(Path(_post_id): Path<String>) -> ApiResult {
    Err((
        StatusCode::NOT_FOUND,
        Json(json!({ "message": "Post not found" })),
    ))
}

async fn delete_post(Path(_post_id): Path<String>) -> ApiResult {
    Err((
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "database unavailable" })),
    ))
}

async fn create_comment(Json(body): Json<Value>) -> ApiResult {
    if body["content"] == "reject" {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "Comment rejected" })),
        ));
    }
    Ok(Json(json!({
        "id": "c1",
        "postId": body["postId"],
        "content": body["content"]
    })))
}

async fn spawn_api(refresh_allowed: bool) -> (String, Arc<MockApi>) {
    let api = Arc::new(MockApi {
        valid_access: Mutex::new("a1".to_string()),
        valid_refresh: Mutex::new("r1".to_string()),
        refresh_allowed,
        refresh_calls: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/likes/toggle/:id", post(toggle_like))
        .route("/api/posts", get(list_posts))
        .route("/api/posts/:id", get(get_post).delete(delete_post))
        .route("/api/comments", post(create_comment))
        .with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/api", addr), api)
}

fn gateway(base_url: &str) -> HttpGateway {
    let config = FeedConfig {
        api_base_url: base_url.to_string(),
        ..FeedConfig::default()
    };
    HttpGateway::new(&config, SessionStore::in_memory()).unwrap()
}

#[tokio::test]
async fn test_login_then_authenticated_call() {
    let (url, _api) = spawn_api(true).await;
    let gateway = gateway(&url);

    let auth = gateway.login("ann", "pw").await.unwrap();
    assert_eq!(auth.user.id.as_str(), "u1");
    assert!(gateway.is_authenticated());

    assert!(gateway.toggle_like(&PostId::from("p1")).await.unwrap());
}

#[tokio::test]
async fn test_bad_credentials() {
    let (url, _api) = spawn_api(true).await;
    let gateway = gateway(&url);

    let err = gateway.login("ann", "wrong").await.unwrap_err();
    assert!(matches!(err, FeedError::AuthError(ref m) if m == "Invalid credentials"));
    assert!(!gateway.is_authenticated());
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once() {
    let (url, api) = spawn_api(true).await;
    let gateway = gateway(&url);
    gateway.login("ann", "pw").await.unwrap();

    // Server forgets the access token
    *api.valid_access.lock() = "rotated-away".to_string();

    assert!(gateway.toggle_like(&PostId::from("p1")).await.unwrap());
    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);

    let tokens = gateway.session().load().unwrap().unwrap();
    assert_eq!(tokens.access_token, "a2");
    assert_eq!(tokens.refresh_token, "r2");
    assert_eq!(tokens.user.unwrap().id.as_str(), "u1");
}

#[tokio::test]
async fn test_rejected_refresh_clears_session() {
    let (url, api) = spawn_api(false).await;
    let gateway = gateway(&url);
    gateway.login("ann", "pw").await.unwrap();
    *api.valid_access.lock() = "rotated-away".to_string();

    let err = gateway.toggle_like(&PostId::from("p1")).await.unwrap_err();
    assert!(matches!(err, FeedError::AuthError(_)));
    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(!gateway.is_authenticated());
}

#[tokio::test]
async fn test_list_posts_sends_cursor() {
    let (url, _api) = spawn_api(true).await;
    let gateway = gateway(&url);
    gateway.login("ann", "pw").await.unwrap();

    let posts = gateway
        .list_posts(PageCursor::new(4, 10))
        .await
        .unwrap();
    let ids: Vec<&str> = posts.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p4", "p5", "p6"]);
    assert_eq!(posts[1].counts.likes.value(), 5);
}

#[tokio::test]
async fn test_error_statuses_map_to_kinds() {
    let (url, _api) = spawn_api(true).await;
    let gateway = gateway(&url);
    gateway.login("ann", "pw").await.unwrap();

    let err = gateway.get_post(&PostId::from("nope")).await.unwrap_err();
    assert!(matches!(err, FeedError::NotFound(ref m) if m == "Post not found"));

    let err = gateway
        .create_comment(&PostId::from("p1"), "reject")
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::ValidationError(ref m) if m == "Comment rejected"));

    let comment = gateway
        .create_comment(&PostId::from("p1"), "  hello ")
        .await
        .unwrap();
    assert_eq!(comment.content, "hello");
}

#[tokio::test]
async fn test_server_error_keeps_message() {
    let (url, _api) = spawn_api(true).await;
    let gateway = gateway(&url);

    let err = gateway.delete_post(&PostId::from("p1")).await.unwrap_err();
    assert!(matches!(
        err,
        FeedError::ServerError { status: 500, ref message } if message == "database unavailable"
    ));
}

#[tokio::test]
async fn test_blank_comment_rejected_locally() {
    let (url, _api) = spawn_api(true).await;
    let gateway = gateway(&url);

    let err = gateway
        .create_comment(&PostId::from("p1"), "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::ValidationError(_)));
}

#[tokio::test]
async fn test_unreachable_backend_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let gateway = gateway(&format!("http://{}/api", addr));
    let err = gateway.check_liked(&PostId::from("p1")).await.unwrap_err();
    assert!(err.is_transient());
}
