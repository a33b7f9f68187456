/// Application root
/// `FeedSession` owns the channel, the gateway and the reconciled state for
/// one logged-in actor. Its lifetime is the actor session: `start` wires
/// the channel handlers, `end` tears everything down. The state lock is
/// never held across a gateway call.
use feed_model::{
    validate_content, Comment, CommentId, Notification, Post, PostId, UserId, UserProfile,
    UserSummary,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    ActionGateway, BroadcastEvent, ChannelClient, ChannelConfig, ClientSignal, Confirmation,
    EntityKey, EventKind, EventType, FeedConfig, FeedError, FeedStore, HttpGateway, Intent,
    KeyValueStore, KindClass, MutationController, Page, PageCursor, PostDraft, Result,
    SessionStore, Subscription, TypingTracker,
};

/// Everything the intent path and the broadcast path both touch.
pub struct FeedState {
    pub store: FeedStore,
    pub controller: MutationController,
    pub presence: TypingTracker,
}

/// Result of a toggle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// The server's relation state after the toggle.
    Confirmed(bool),
    /// A toggle for the same entity was still in flight.
    Ignored,
}

pub struct FeedSession {
    config: FeedConfig,
    actor: UserSummary,
    gateway: Arc<dyn ActionGateway>,
    channel: Arc<ChannelClient>,
    session: SessionStore,
    state: Arc<Mutex<FeedState>>,
    subscriptions: Mutex<Vec<Subscription>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FeedSession {
    pub fn new(
        config: FeedConfig,
        actor: UserSummary,
        gateway: Arc<dyn ActionGateway>,
        channel: Arc<ChannelClient>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        let state = FeedState {
            store: FeedStore::from_config(&config, storage.clone()),
            controller: MutationController::new(actor.id.clone(), config.settle_window),
            presence: TypingTracker::new(actor.id.clone(), actor.label(), config.settle_window),
        };

        Self {
            config,
            actor,
            gateway,
            channel,
            session: SessionStore::new(storage),
            state: Arc::new(Mutex::new(state)),
            subscriptions: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Session backed by the HTTP gateway and a WebSocket channel.
    pub fn with_http(
        config: FeedConfig,
        actor: UserSummary,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let gateway = HttpGateway::new(&config, SessionStore::new(storage.clone()))?;
        let channel = ChannelClient::new(ChannelConfig::from(&config));
        Ok(Self::new(
            config,
            actor,
            Arc::new(gateway),
            Arc::new(channel),
            storage,
        ))
    }

    pub fn actor(&self) -> &UserSummary {
        &self.actor
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<ChannelClient> {
        &self.channel
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.session.load(), Ok(Some(_)))
    }

    /// Connect the channel and route every event type into the state.
    pub fn start(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FeedError::ChannelError(format!("no async runtime: {}", e)))?;

        {
            let mut subscriptions = self.subscriptions.lock();
            for event_type in EventType::ALL {
                let state = self.state.clone();
                subscriptions.push(
                    self.channel
                        .subscribe(event_type, move |event| route_event(&state, event)),
                );
            }
        }

        self.channel.set_auth_token(self.session.access_token());
        self.channel.connect(&self.actor.id)?;

        let period = (self.config.settle_window / 4).max(Duration::from_millis(10));
        let state = self.state.clone();
        let channel = self.channel.clone();
        *sweeper = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                sweep_state(&state, &channel);
            }
        }));

        info!("Feed session started for {}", self.actor.id);
        Ok(())
    }

    /// Disconnect and forget everything transient. Pending gateway calls
    /// that finish later resolve into nothing.
    pub fn end(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        self.channel.disconnect();

        let mut state = self.state.lock();
        state.controller.clear();
        state.presence.clear();
        info!("Feed session ended for {}", self.actor.id);
    }

    /// Expire typing indicators and stale tombstones now. The background
    /// sweeper calls this periodically.
    pub fn sweep(&self) {
        sweep_state(&self.state, &self.channel);
    }

    /// Run `f` against a consistent snapshot of the state.
    pub fn read<R>(&self, f: impl FnOnce(&FeedState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn post(&self, post_id: &PostId) -> Option<Post> {
        self.state.lock().store.post(post_id).cloned()
    }

    pub fn posts(&self) -> Vec<Post> {
        self.state.lock().store.posts.items().to_vec()
    }

    pub fn user(&self, user_id: &UserId) -> Option<UserProfile> {
        self.state.lock().store.user(user_id).cloned()
    }

    pub fn comments(&self, post_id: &PostId) -> Vec<Comment> {
        self.state
            .lock()
            .store
            .comments(post_id)
            .map(|list| list.items().to_vec())
            .unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().store.notifications().to_vec()
    }

    pub fn unread_count(&self) -> usize {
        self.state.lock().store.unread_count()
    }

    pub fn clear_notifications(&self) {
        self.state.lock().store.clear_notifications();
    }

    /// Feed an event through the same path the channel uses.
    pub fn handle_event(&self, event: &BroadcastEvent) {
        route_event(&self.state, event);
    }

    pub async fn toggle_like(&self, post_id: &PostId) -> Result<Toggle> {
        let outcome = self
            .mutate(
                Intent::ToggleLike(post_id.clone()),
                self.gateway.toggle_like(post_id),
                |liked| Confirmation::Relation(*liked),
            )
            .await?;
        Ok(outcome.map_or(Toggle::Ignored, Toggle::Confirmed))
    }

    pub async fn toggle_follow(&self, user_id: &UserId) -> Result<Toggle> {
        let outcome = self
            .mutate(
                Intent::ToggleFollow(user_id.clone()),
                self.gateway.toggle_follow(user_id),
                |following| Confirmation::Relation(*following),
            )
            .await?;
        Ok(outcome.map_or(Toggle::Ignored, Toggle::Confirmed))
    }

    /// Post a comment. `Ok(None)` means another comment on the same post was
    /// still being submitted.
    pub async fn create_comment(&self, post_id: &PostId, content: &str) -> Result<Option<Comment>> {
        let content = validate_content(content)?.to_string();
        self.stop_typing();

        if self.state.lock().store.post(post_id).is_none() {
            let comment = self.gateway.create_comment(post_id, &content).await?;
            return Ok(Some(comment));
        }

        self.mutate(
            Intent::CreateComment(post_id.clone()),
            self.gateway.create_comment(post_id, &content),
            |comment| Confirmation::Comment(comment.clone()),
        )
        .await
    }

    pub async fn update_comment(&self, comment_id: &CommentId, content: &str) -> Result<Comment> {
        let content = validate_content(content)?.to_string();
        let comment = self.gateway.update_comment(comment_id, &content).await?;

        let mut state = self.state.lock();
        if let Some(list) = state.store.comments_mut(&comment.post_id) {
            list.merge_existing(comment.clone());
        }
        Ok(comment)
    }

    pub async fn delete_comment(&self, comment_id: &CommentId) -> Result<()> {
        self.gateway.delete_comment(comment_id).await?;

        let mut state = self.state.lock();
        let store = &mut state.store;
        // Only adjust locally when the list is loaded; otherwise the
        // broadcast does it.
        if let Some(post_id) = store.comment_owner(comment_id) {
            let removed = store
                .comments_mut(&post_id)
                .and_then(|list| list.remove(comment_id))
                .is_some();
            if removed {
                if let Some(post) = store.post_mut(&post_id) {
                    post.counts.comments.apply_confirmed(-1);
                }
            }
        }
        Ok(())
    }

    pub async fn create_post(&self, draft: &PostDraft) -> Result<Post> {
        let draft = draft.validated()?;
        let post = self.gateway.create_post(&draft).await?;
        self.state.lock().store.posts.prepend(post.clone());
        info!("Created post {}", post.id);
        Ok(post)
    }

    pub async fn update_post(&self, post_id: &PostId, draft: &PostDraft) -> Result<Post> {
        let draft = draft.validated()?;
        let post = self.gateway.update_post(post_id, &draft).await?;
        if let Some(existing) = self.state.lock().store.post_mut(post_id) {
            existing.apply_edit(&post);
        }
        Ok(post)
    }

    pub async fn delete_post(&self, post_id: &PostId) -> Result<()> {
        self.gateway.delete_post(post_id).await?;
        self.state.lock().store.remove_post(post_id);
        Ok(())
    }

    /// Count a view of `post_id` at most once per device. Returns true when
    /// a new view was recorded.
    pub async fn record_view(&self, post_id: &PostId) -> Result<bool> {
        let (seen, loaded) = {
            let state = self.state.lock();
            (
                state.store.viewed().contains(post_id),
                state.store.post(post_id).is_some(),
            )
        };
        if seen {
            return Ok(false);
        }

        if self.gateway.check_viewed(post_id).await? {
            self.mark_viewed(post_id);
            return Ok(false);
        }

        let created = if loaded {
            self.mutate(
                Intent::CreateView(post_id.clone()),
                self.gateway.create_view(post_id),
                |_| Confirmation::View,
            )
            .await?
            .is_some()
        } else {
            self.gateway.create_view(post_id).await?;
            true
        };

        if created {
            self.mark_viewed(post_id);
        }
        Ok(created)
    }

    /// Fetch the next page of the feed. A no-op once the end is reached or
    /// while another fetch is running.
    pub async fn load_next_posts(&self) -> Result<Page> {
        let cursor = self.state.lock().store.posts.begin_fetch();
        let Some(cursor) = cursor else {
            return Ok(self.read(|state| {
                idle_page(state.store.posts.cursor(), state.store.posts.has_more())
            }));
        };

        let posts = match self.fetch_posts(cursor).await {
            Ok(posts) => posts,
            Err(e) => {
                self.state.lock().store.posts.cancel_fetch();
                warn!("Loading posts failed: {}", e);
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        let FeedState { store, controller, .. } = &mut *state;
        let posts = keep_local_likes(controller, posts);
        let merged = snapshot_keys(store.posts.is_current(&cursor), &posts, |p| {
            EntityKey::Post(p.id.clone())
        });
        let page = store.posts.apply_page(cursor, posts);
        let resolved = resolve_snapshots(controller, store, merged);
        debug!(
            "Loaded {} posts at offset {}, {} mutations resolved",
            page.inserted, cursor.offset, resolved
        );
        Ok(page)
    }

    /// Manual full re-fetch of the first page. Also resolves mutations whose
    /// broadcast never arrived.
    pub async fn refresh(&self) -> Result<Page> {
        let limit = self.state.lock().store.posts.cursor().limit;
        let posts = self.fetch_posts(PageCursor::new(0, limit)).await?;

        let mut state = self.state.lock();
        let FeedState { store, controller, .. } = &mut *state;
        let posts = keep_local_likes(controller, posts);
        let merged = snapshot_keys(true, &posts, |p| EntityKey::Post(p.id.clone()));
        let page = store.posts.replace_with_page(posts);
        let resolved = resolve_snapshots(controller, store, merged);
        info!("Refreshed feed: {} posts, {} mutations resolved", page.inserted, resolved);
        Ok(page)
    }

    pub async fn load_comments(&self, post_id: &PostId) -> Result<Page> {
        let cursor = self.state.lock().store.open_comments(post_id).begin_fetch();
        let Some(cursor) = cursor else {
            return Ok(self.read(|state| {
                state
                    .store
                    .comments(post_id)
                    .map(|list| idle_page(list.cursor(), list.has_more()))
                    .unwrap_or(idle_page(PageCursor::new(0, 0), false))
            }));
        };

        match self.gateway.list_comments(post_id, cursor).await {
            Ok(comments) => Ok(self
                .state
                .lock()
                .store
                .open_comments(post_id)
                .apply_page(cursor, comments)),
            Err(e) => {
                if let Some(list) = self.state.lock().store.comments_mut(post_id) {
                    list.cancel_fetch();
                }
                Err(e)
            }
        }
    }

    /// Next page of the user directory, with follow state filled in.
    pub async fn load_users(&self) -> Result<Page> {
        let cursor = self.state.lock().store.users.begin_fetch();
        let Some(cursor) = cursor else {
            return Ok(self.read(|state| {
                idle_page(state.store.users.cursor(), state.store.users.has_more())
            }));
        };

        let users = match self.gateway.list_users(cursor).await {
            Ok(users) => self.with_follow_state(users).await,
            Err(e) => {
                self.state.lock().store.users.cancel_fetch();
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        let FeedState { store, controller, .. } = &mut *state;
        let users = keep_local_follows(controller, users);
        let merged = snapshot_keys(store.users.is_current(&cursor), &users, |u| {
            EntityKey::User(u.id.clone())
        });
        let page = store.users.apply_page(cursor, users);
        resolve_snapshots(controller, store, merged);
        Ok(page)
    }

    pub async fn load_followers(&self, user_id: &UserId) -> Result<Page> {
        let cursor = self.state.lock().store.open_followers(user_id).begin_fetch();
        let Some(cursor) = cursor else {
            return Ok(self.read(|state| {
                state
                    .store
                    .followers(user_id)
                    .map(|list| idle_page(list.cursor(), list.has_more()))
                    .unwrap_or(idle_page(PageCursor::new(0, 0), false))
            }));
        };

        let followers = match self.gateway.list_followers(user_id, cursor).await {
            Ok(users) => self.with_follow_state(users).await,
            Err(e) => {
                if let Some(list) = self.state.lock().store.followers_mut(user_id) {
                    list.cancel_fetch();
                }
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        let FeedState { store, controller, .. } = &mut *state;
        let followers = keep_local_follows(controller, followers);
        let list = store.open_followers(user_id);
        let merged = snapshot_keys(list.is_current(&cursor), &followers, |u| {
            EntityKey::User(u.id.clone())
        });
        let page = list.apply_page(cursor, followers);
        resolve_snapshots(controller, store, merged);
        Ok(page)
    }

    pub fn start_typing(&self, post_id: &PostId) {
        let signals = self.state.lock().presence.start_typing(post_id);
        self.emit_all(signals);
    }

    pub fn stop_typing(&self) {
        let signal = self.state.lock().presence.stop_typing();
        self.emit_all(signal);
    }

    /// Comment box content changed.
    pub fn typing_input(&self, post_id: &PostId, text: &str) {
        let signals = self.state.lock().presence.input_changed(post_id, text);
        self.emit_all(signals);
    }

    pub fn typing_labels(&self, post_id: &PostId) -> Vec<String> {
        self.state.lock().presence.typing_labels(post_id)
    }

    async fn mutate<T>(
        &self,
        intent: Intent,
        call: impl Future<Output = Result<T>>,
        confirmation: impl FnOnce(&T) -> Confirmation,
    ) -> Result<Option<T>> {
        let description = format!("{:?}", intent);
        let begun = self.reconcile(|store, controller| controller.begin(store, intent))?;
        let Some(id) = begun else {
            return Ok(None);
        };

        match call.await {
            Ok(value) => {
                let confirmed = confirmation(&value);
                self.reconcile(|store, controller| controller.confirm(store, id, confirmed));
                Ok(Some(value))
            }
            Err(e) => {
                self.reconcile(|store, controller| controller.fail(store, id));
                warn!("{} failed: {}", description, e);
                Err(e)
            }
        }
    }

    fn reconcile<R>(&self, f: impl FnOnce(&mut FeedStore, &mut MutationController) -> R) -> R {
        let mut state = self.state.lock();
        let FeedState { store, controller, .. } = &mut *state;
        f(store, controller)
    }

    async fn fetch_posts(&self, cursor: PageCursor) -> Result<Vec<Post>> {
        let mut posts = self.gateway.list_posts(cursor).await?;

        let checks = join_all(
            posts
                .iter()
                .filter(|post| post.liked.is_none())
                .map(|post| self.gateway.check_liked(&post.id)),
        )
        .await;

        let mut results = checks.into_iter();
        for post in posts.iter_mut().filter(|post| post.liked.is_none()) {
            let liked = match results.next() {
                Some(Ok(liked)) => liked,
                Some(Err(e)) => {
                    warn!("Like check for {} failed: {}", post.id, e);
                    false
                }
                None => false,
            };
            post.liked = Some(liked);
        }
        Ok(posts)
    }

    async fn with_follow_state(&self, mut users: Vec<UserProfile>) -> Vec<UserProfile> {
        let actor = self.actor.id.clone();
        let needs_check =
            |user: &UserProfile| user.following.is_none() && user.id != actor;

        let checks = join_all(
            users
                .iter()
                .filter(|user| needs_check(*user))
                .map(|user| self.gateway.check_following(&user.id)),
        )
        .await;

        let mut results = checks.into_iter();
        for user in users.iter_mut() {
            if !needs_check(user) {
                continue;
            }
            let following = match results.next() {
                Some(Ok(following)) => following,
                Some(Err(e)) => {
                    warn!("Follow check for {} failed: {}", user.id, e);
                    false
                }
                None => false,
            };
            user.following = Some(following);
        }
        users
    }

    fn mark_viewed(&self, post_id: &PostId) {
        self.state.lock().store.viewed_mut().insert(post_id.clone());
    }

    fn emit_all(&self, signals: impl IntoIterator<Item = ClientSignal>) {
        for signal in signals {
            emit_signal(&self.channel, &signal);
        }
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn route_event(state: &Mutex<FeedState>, event: &BroadcastEvent) {
    let mut state = state.lock();
    match &event.kind {
        EventKind::CommentTyping(signal) => {
            state.presence.observe(signal, true);
        }
        EventKind::CommentStopTyping(signal) => {
            state.presence.observe(signal, false);
        }
        _ => {
            let FeedState { store, controller, .. } = &mut *state;
            let outcome = controller.observe(store, event);
            debug!("{} -> {:?}", event.event_type(), outcome);
        }
    }
}

fn sweep_state(state: &Mutex<FeedState>, channel: &ChannelClient) {
    let now = Instant::now();
    let stop = {
        let mut state = state.lock();
        state.controller.purge_expired(now);
        state.presence.sweep(now)
    };
    if let Some(signal) = stop {
        emit_signal(channel, &signal);
    }
}

fn emit_signal(channel: &ChannelClient, signal: &ClientSignal) {
    if let Err(e) = channel.emit(signal) {
        debug!("Presence signal {} dropped: {}", signal.event_type(), e);
    }
}

fn idle_page(cursor: PageCursor, has_more: bool) -> Page {
    Page {
        inserted: 0,
        next_cursor: cursor,
        has_more,
    }
}

/// While a like is in flight the local flag wins over a fetched one.
fn keep_local_likes(controller: &MutationController, mut posts: Vec<Post>) -> Vec<Post> {
    for post in &mut posts {
        if controller.is_outstanding(&EntityKey::Post(post.id.clone()), KindClass::Like) {
            post.liked = None;
        }
    }
    posts
}

/// Entities whose server snapshot is about to be merged, or none when the
/// page will be dropped.
fn snapshot_keys<T>(applies: bool, items: &[T], key: impl Fn(&T) -> EntityKey) -> Vec<EntityKey> {
    if applies {
        items.iter().map(key).collect()
    } else {
        Vec::new()
    }
}

fn resolve_snapshots(
    controller: &mut MutationController,
    store: &mut FeedStore,
    merged: Vec<EntityKey>,
) -> usize {
    merged
        .iter()
        .map(|entity| controller.resolve_snapshot(store, entity))
        .sum()
}

fn keep_local_follows(
    controller: &MutationController,
    mut users: Vec<UserProfile>,
) -> Vec<UserProfile> {
    for user in &mut users {
        if controller.is_outstanding(&EntityKey::User(user.id.clone()), KindClass::Follow) {
            user.following = None;
        }
    }
    users
}
