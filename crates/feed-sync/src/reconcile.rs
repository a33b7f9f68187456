/// Optimistic mutation controller
/// Merges three sources for the same piece of state: the local optimistic
/// change, the gateway confirmation and the broadcast event that every
/// session (including ours) receives. Counters are only ever settled by
/// the broadcast; the gateway answer is authoritative for relation flags.
use chrono::{DateTime, Utc};
use feed_model::{Comment, Counter, PostId, UserId, UserProfile};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{BroadcastEvent, EventKind, FeedError, FeedStore, Result};

const SEEN_EVENT_CAPACITY: usize = 4096;
const TOMBSTONE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Like,
    Unlike,
    Follow,
    Unfollow,
    CommentCreate,
    ViewCreate,
}

/// Mutations of the same class on the same entity exclude each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
    Like,
    Follow,
    Comment,
    View,
}

impl MutationKind {
    pub fn class(&self) -> KindClass {
        match self {
            MutationKind::Like | MutationKind::Unlike => KindClass::Like,
            MutationKind::Follow | MutationKind::Unfollow => KindClass::Follow,
            MutationKind::CommentCreate => KindClass::Comment,
            MutationKind::ViewCreate => KindClass::View,
        }
    }

    pub fn delta(&self) -> i64 {
        match self {
            MutationKind::Unlike | MutationKind::Unfollow => -1,
            _ => 1,
        }
    }

    /// Relation state after the mutation, for toggles.
    pub fn relation(&self) -> Option<bool> {
        match self {
            MutationKind::Like | MutationKind::Follow => Some(true),
            MutationKind::Unlike | MutationKind::Unfollow => Some(false),
            _ => None,
        }
    }

    fn toggle(class: KindClass, target: bool) -> Self {
        match (class, target) {
            (KindClass::Follow, true) => MutationKind::Follow,
            (KindClass::Follow, false) => MutationKind::Unfollow,
            (_, true) => MutationKind::Like,
            (_, false) => MutationKind::Unlike,
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Like => "like",
            MutationKind::Unlike => "unlike",
            MutationKind::Follow => "follow",
            MutationKind::Unfollow => "unfollow",
            MutationKind::CommentCreate => "comment-create",
            MutationKind::ViewCreate => "view-create",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Post(PostId),
    User(UserId),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Post(id) => write!(f, "post {}", id),
            EntityKey::User(id) => write!(f, "user {}", id),
        }
    }
}

/// What the local actor asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    ToggleLike(PostId),
    ToggleFollow(UserId),
    CreateComment(PostId),
    CreateView(PostId),
}

impl Intent {
    fn entity(&self) -> EntityKey {
        match self {
            Intent::ToggleLike(id) | Intent::CreateComment(id) | Intent::CreateView(id) => {
                EntityKey::Post(id.clone())
            }
            Intent::ToggleFollow(id) => EntityKey::User(id.clone()),
        }
    }

    fn class(&self) -> KindClass {
        match self {
            Intent::ToggleLike(_) => KindClass::Like,
            Intent::ToggleFollow(_) => KindClass::Follow,
            Intent::CreateComment(_) => KindClass::Comment,
            Intent::CreateView(_) => KindClass::View,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct OptimisticMutation {
    pub id: MutationId,
    pub entity: EntityKey,
    pub kind: MutationKind,
    pub local_timestamp: DateTime<Utc>,
    pub expected_server_echo: bool,
    // Amount actually added to the counter after flooring.
    applied: i64,
    prior_relation: Option<bool>,
    gateway_confirmed: bool,
    echo_observed: bool,
    // A server snapshot of the entity was merged while the request was in
    // flight; its confirmed counts are taken to include this change.
    snapshot_merged: bool,
    confirmed_at: Option<Instant>,
}

impl OptimisticMutation {
    pub fn is_gateway_confirmed(&self) -> bool {
        self.gateway_confirmed
    }

    pub fn is_echo_observed(&self) -> bool {
        self.echo_observed
    }

    fn is_overdue(&self, now: Instant, grace: Duration) -> bool {
        match self.confirmed_at {
            Some(at) => self.gateway_confirmed && !self.echo_observed && now - at >= grace,
            None => false,
        }
    }
}

/// Server answer for a mutation.
#[derive(Debug, Clone)]
pub enum Confirmation {
    Relation(bool),
    Comment(Comment),
    View,
}

/// What `observe` did with a broadcast event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// Matched an outstanding mutation; its prediction was settled.
    SelfEcho(MutationId),
    /// Late echo of a mutation already resolved by refresh or timeout.
    Absorbed,
    Applied,
    Duplicate,
    Ignored,
}

#[derive(Debug, Clone)]
struct Tombstone {
    entity: EntityKey,
    kind: MutationKind,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct SeenEvents {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl SeenEvents {
    fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() >= SEEN_EVENT_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

pub struct MutationController {
    actor: UserId,
    grace_window: Duration,
    next_id: u64,
    outstanding: HashMap<(EntityKey, KindClass), OptimisticMutation>,
    tombstones: Vec<Tombstone>,
    seen: SeenEvents,
}

impl MutationController {
    pub fn new(actor: UserId, grace_window: Duration) -> Self {
        Self {
            actor,
            grace_window,
            next_id: 1,
            outstanding: HashMap::new(),
            tombstones: Vec::new(),
            seen: SeenEvents::default(),
        }
    }

    pub fn actor(&self) -> &UserId {
        &self.actor
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn get(&self, id: MutationId) -> Option<&OptimisticMutation> {
        self.outstanding.values().find(|m| m.id == id)
    }

    pub fn is_outstanding(&self, entity: &EntityKey, class: KindClass) -> bool {
        self.outstanding.contains_key(&(entity.clone(), class))
    }

    /// Apply the local prediction for `intent`. Returns `None` when a
    /// mutation of the same class is already outstanding for the entity:
    /// the intent is dropped, not queued.
    pub fn begin(&mut self, store: &mut FeedStore, intent: Intent) -> Result<Option<MutationId>> {
        let entity = intent.entity();
        let class = intent.class();
        let key = (entity.clone(), class);

        if let Some(existing) = self.outstanding.get(&key) {
            if !existing.is_overdue(Instant::now(), self.grace_window) {
                debug!("Ignoring {:?} on {}: {} still outstanding", class, entity, existing.id);
                return Ok(None);
            }
            if let Some(overdue) = self.outstanding.remove(&key) {
                self.fold_overdue(store, overdue);
            }
        }

        if let Intent::ToggleFollow(user_id) = &intent {
            if *user_id == self.actor {
                return Err(FeedError::ValidationError(
                    "cannot follow yourself".to_string(),
                ));
            }
        }

        let (kind, applied, prior_relation) = match &intent {
            Intent::ToggleLike(post_id) => {
                let post = store
                    .post_mut(post_id)
                    .ok_or_else(|| FeedError::NotFound(format!("post {}", post_id)))?;
                let prior = post.is_liked();
                let kind = MutationKind::toggle(KindClass::Like, !prior);
                post.liked = Some(!prior);
                let applied = post.counts.likes.predict(kind.delta());
                (kind, applied, Some(prior))
            }
            Intent::ToggleFollow(user_id) => {
                let user = store
                    .user_mut(user_id)
                    .ok_or_else(|| FeedError::NotFound(format!("user {}", user_id)))?;
                let prior = user.is_followed();
                let kind = MutationKind::toggle(KindClass::Follow, !prior);
                let applied = user.counts.followers.predict(kind.delta());
                store.set_following(user_id, Some(!prior));
                (kind, applied, Some(prior))
            }
            Intent::CreateComment(post_id) => {
                let post = store
                    .post_mut(post_id)
                    .ok_or_else(|| FeedError::NotFound(format!("post {}", post_id)))?;
                let applied = post.counts.comments.predict(1);
                (MutationKind::CommentCreate, applied, None)
            }
            Intent::CreateView(post_id) => {
                let post = store
                    .post_mut(post_id)
                    .ok_or_else(|| FeedError::NotFound(format!("post {}", post_id)))?;
                let applied = post.counts.views.predict(1);
                (MutationKind::ViewCreate, applied, None)
            }
        };

        let id = MutationId(self.next_id);
        self.next_id += 1;
        debug!("Began {} {} on {}", id, kind, entity);

        self.outstanding.insert(
            key,
            OptimisticMutation {
                id,
                entity,
                kind,
                local_timestamp: Utc::now(),
                expected_server_echo: true,
                applied,
                prior_relation,
                gateway_confirmed: false,
                echo_observed: false,
                snapshot_merged: false,
                confirmed_at: None,
            },
        );
        Ok(Some(id))
    }

    /// The gateway call for `id` succeeded. Unknown ids are ignored so a
    /// late answer after a refresh or teardown is harmless.
    pub fn confirm(&mut self, store: &mut FeedStore, id: MutationId, confirmation: Confirmation) {
        let Some(key) = self.key_of(id) else {
            debug!("Confirmation for resolved mutation {}", id);
            return;
        };
        let Some(mutation) = self.outstanding.get_mut(&key) else {
            return;
        };

        match confirmation {
            Confirmation::Relation(actual) => {
                if mutation.kind.relation() != Some(actual) && !mutation.echo_observed {
                    // Another session changed the relation first; the server
                    // did the opposite of what we predicted.
                    let actual_kind = MutationKind::toggle(key.1, actual);
                    info!(
                        "Server applied {} instead of {} on {}",
                        actual_kind, mutation.kind, mutation.entity
                    );
                    if let Some(counter) = counter_mut(store, &mutation.entity, key.1) {
                        counter.retract(mutation.applied);
                        mutation.applied = counter.predict(actual_kind.delta());
                    } else {
                        mutation.applied = 0;
                    }
                    mutation.kind = actual_kind;
                }
                set_relation(store, &mutation.entity, key.1, actual);
            }
            Confirmation::Comment(comment) => {
                if let Some(list) = store.comments_mut(&comment.post_id) {
                    list.prepend(comment);
                }
            }
            Confirmation::View => {}
        }

        mutation.gateway_confirmed = true;
        mutation.confirmed_at = Some(Instant::now());

        if mutation.echo_observed {
            debug!("Resolved {} (echo arrived first)", id);
            self.outstanding.remove(&key);
        } else if mutation.snapshot_merged {
            if let Some(mutation) = self.outstanding.remove(&key) {
                self.absorb_into_snapshot(store, mutation);
            }
        }
    }

    /// The gateway call for `id` failed: undo the prediction unless the
    /// server already broadcast the change. Returns false for unknown ids.
    pub fn fail(&mut self, store: &mut FeedStore, id: MutationId) -> bool {
        let Some(key) = self.key_of(id) else {
            return false;
        };
        let Some(mutation) = self.outstanding.remove(&key) else {
            return false;
        };

        if mutation.echo_observed {
            warn!(
                "{} failed after its broadcast was seen; keeping server state for {}",
                id, mutation.entity
            );
            return true;
        }

        if let Some(counter) = counter_mut(store, &mutation.entity, key.1) {
            counter.retract(mutation.applied);
        }
        if let Some(prior) = mutation.prior_relation {
            set_relation(store, &mutation.entity, key.1, prior);
        }
        warn!("Rolled back {} {} on {}", id, mutation.kind, mutation.entity);
        true
    }

    /// Reconcile one broadcast event with local state.
    pub fn observe(&mut self, store: &mut FeedStore, event: &BroadcastEvent) -> Observed {
        if event.event_type().is_presence() {
            return Observed::Ignored;
        }

        if let Some(key) = event.dedup_key() {
            if !self.seen.insert(key) {
                debug!("Duplicate {} event dropped", event.event_type());
                return Observed::Duplicate;
            }
        }

        let from_self = event.actor() == Some(&self.actor);
        if from_self {
            if let Some((entity, kind)) = echo_target(event) {
                // A resolved mutation's echo is older than any newer one.
                if let Some(pos) = self
                    .tombstones
                    .iter()
                    .position(|t| t.entity == entity && t.kind == kind)
                {
                    self.tombstones.remove(pos);
                    debug!("Late echo for {} {} absorbed", kind, entity);
                    apply_event(store, event, false, false);
                    return Observed::Absorbed;
                }
                if let Some(outcome) = self.settle_echo(store, event, entity, kind) {
                    return outcome;
                }
            }
        }

        // Foreign actor, or the local actor acting from another session.
        apply_event(store, event, true, from_self);
        Observed::Applied
    }

    fn settle_echo(
        &mut self,
        store: &mut FeedStore,
        event: &BroadcastEvent,
        entity: EntityKey,
        kind: MutationKind,
    ) -> Option<Observed> {
        let key = (entity, kind.class());
        let mutation = self.outstanding.get_mut(&key)?;

        if mutation.echo_observed {
            return (mutation.kind == kind).then_some(Observed::Duplicate);
        }

        if mutation.kind == kind {
            if let Some(counter) = counter_mut(store, &mutation.entity, key.1) {
                if mutation.snapshot_merged {
                    counter.absorb(mutation.applied);
                } else {
                    counter.settle(mutation.applied);
                }
            }
        } else if !mutation.gateway_confirmed {
            // Our request raced another session and the server did the
            // opposite; the echo tells us what really happened.
            if let Some(counter) = counter_mut(store, &mutation.entity, key.1) {
                counter.retract(mutation.applied);
                if !mutation.snapshot_merged {
                    counter.apply_confirmed(kind.delta());
                }
            }
            mutation.applied = 0;
            mutation.kind = kind;
            if let Some(relation) = kind.relation() {
                set_relation(store, &mutation.entity, key.1, relation);
            }
        } else {
            return None;
        }

        let id = mutation.id;
        mutation.echo_observed = true;
        apply_event(store, event, false, false);

        if mutation.gateway_confirmed {
            self.outstanding.remove(&key);
        }
        debug!("Self-echo settled {}", id);
        Some(Observed::SelfEcho(id))
    }

    /// A fresh server snapshot of `entity` was just merged into the store,
    /// by a page load or a refresh. Its confirmed counts already contain
    /// every change the gateway confirmed, so those predictions are absorbed
    /// and their echoes tombstoned. Mutations still in flight are marked:
    /// their confirmation or echo absorbs instead of counting again.
    /// Returns how many mutations were resolved.
    pub fn resolve_snapshot(&mut self, store: &mut FeedStore, entity: &EntityKey) -> usize {
        let mut confirmed = Vec::new();
        for (key, mutation) in self.outstanding.iter_mut() {
            if key.0 != *entity || mutation.echo_observed {
                continue;
            }
            if mutation.gateway_confirmed {
                confirmed.push(key.clone());
            } else {
                mutation.snapshot_merged = true;
            }
        }

        for key in &confirmed {
            if let Some(mutation) = self.outstanding.remove(key) {
                self.absorb_into_snapshot(store, mutation);
            }
        }
        confirmed.len()
    }

    /// Drop tombstones nobody claimed.
    pub fn purge_expired(&mut self, now: Instant) {
        self.tombstones.retain(|t| t.expires_at > now);
    }

    /// Forget all pending work; used when the session ends.
    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.tombstones.clear();
        self.seen = SeenEvents::default();
    }

    fn absorb_into_snapshot(&mut self, store: &mut FeedStore, mutation: OptimisticMutation) {
        debug!(
            "Resolved {} {} on {} from snapshot",
            mutation.id, mutation.kind, mutation.entity
        );
        if let Some(counter) = counter_mut(store, &mutation.entity, mutation.kind.class()) {
            counter.absorb(mutation.applied);
        }
        self.tombstones.push(Tombstone {
            entity: mutation.entity,
            kind: mutation.kind,
            expires_at: Instant::now() + TOMBSTONE_TTL,
        });
    }

    fn fold_overdue(&mut self, store: &mut FeedStore, mutation: OptimisticMutation) {
        debug!(
            "{} {} on {} confirmed without echo; settling",
            mutation.id, mutation.kind, mutation.entity
        );
        if let Some(counter) = counter_mut(store, &mutation.entity, mutation.kind.class()) {
            counter.settle(mutation.applied);
        }
        self.tombstones.push(Tombstone {
            entity: mutation.entity,
            kind: mutation.kind,
            expires_at: Instant::now() + TOMBSTONE_TTL,
        });
    }

    fn key_of(&self, id: MutationId) -> Option<(EntityKey, KindClass)> {
        self.outstanding
            .iter()
            .find(|(_, m)| m.id == id)
            .map(|(key, _)| key.clone())
    }
}

/// Entity and mutation kind a self-authored event would echo.
fn echo_target(event: &BroadcastEvent) -> Option<(EntityKey, MutationKind)> {
    match &event.kind {
        EventKind::LikeCreated(like) => Some((EntityKey::Post(like.post_id.clone()), MutationKind::Like)),
        EventKind::LikeRemoved(like) => {
            Some((EntityKey::Post(like.post_id.clone()), MutationKind::Unlike))
        }
        EventKind::FollowerCreated(f) => {
            Some((EntityKey::User(f.followed_id.clone()), MutationKind::Follow))
        }
        EventKind::FollowRemoved(f) => {
            Some((EntityKey::User(f.followed_id.clone()), MutationKind::Unfollow))
        }
        EventKind::CommentCreated(c) => {
            Some((EntityKey::Post(c.post_id.clone()), MutationKind::CommentCreate))
        }
        EventKind::ViewCreated(v) => Some((EntityKey::Post(v.post_id.clone()), MutationKind::ViewCreate)),
        _ => None,
    }
}

fn counter_mut<'a>(
    store: &'a mut FeedStore,
    entity: &EntityKey,
    class: KindClass,
) -> Option<&'a mut Counter> {
    match (entity, class) {
        (EntityKey::Post(id), KindClass::Like) => store.post_mut(id).map(|p| &mut p.counts.likes),
        (EntityKey::Post(id), KindClass::Comment) => {
            store.post_mut(id).map(|p| &mut p.counts.comments)
        }
        (EntityKey::Post(id), KindClass::View) => store.post_mut(id).map(|p| &mut p.counts.views),
        (EntityKey::User(id), KindClass::Follow) => {
            store.user_mut(id).map(|u| &mut u.counts.followers)
        }
        _ => None,
    }
}

fn set_relation(store: &mut FeedStore, entity: &EntityKey, class: KindClass, value: bool) {
    match (entity, class) {
        (EntityKey::Post(id), KindClass::Like) => {
            if let Some(post) = store.post_mut(id) {
                post.liked = Some(value);
            }
        }
        (EntityKey::User(id), KindClass::Follow) => store.set_following(id, Some(value)),
        _ => {}
    }
}

/// Apply the state change an event describes. `count` is false when the
/// event's counter delta is already accounted for by a settled prediction;
/// `own_relation` is true when the local actor made the change elsewhere.
fn apply_event(store: &mut FeedStore, event: &BroadcastEvent, count: bool, own_relation: bool) {
    match &event.kind {
        EventKind::PostCreated(post) => {
            store.posts.prepend(post.clone());
        }
        EventKind::PostUpdated(post) => {
            if let Some(existing) = store.post_mut(&post.id) {
                existing.apply_edit(post);
            }
        }
        EventKind::PostDeleted(deleted) => {
            store.remove_post(&deleted.post_id);
        }
        EventKind::LikeCreated(like) | EventKind::LikeRemoved(like) => {
            let created = matches!(event.kind, EventKind::LikeCreated(_));
            if let Some(post) = store.post_mut(&like.post_id) {
                if count {
                    post.counts.likes.apply_confirmed(if created { 1 } else { -1 });
                }
                if own_relation {
                    post.liked = Some(created);
                }
            }
        }
        EventKind::CommentCreated(comment) => {
            let inserted = match store.comments_mut(&comment.post_id) {
                Some(list) => list.prepend(comment.clone()),
                None => true,
            };
            if count && inserted {
                if let Some(post) = store.post_mut(&comment.post_id) {
                    post.counts.comments.apply_confirmed(1);
                }
            }
        }
        EventKind::CommentUpdated(comment) => {
            if let Some(list) = store.comments_mut(&comment.post_id) {
                list.merge_existing(comment.clone());
            }
        }
        EventKind::CommentDeleted(deleted) => {
            let post_id = deleted
                .post_id
                .clone()
                .or_else(|| store.comment_owner(&deleted.comment_id));
            let Some(post_id) = post_id else {
                return;
            };
            let removed = match store.comments_mut(&post_id) {
                Some(list) => list.remove(&deleted.comment_id).is_some(),
                None => true,
            };
            if count && removed {
                if let Some(post) = store.post_mut(&post_id) {
                    post.counts.comments.apply_confirmed(-1);
                }
            }
        }
        EventKind::ViewCreated(view) => {
            if count {
                if let Some(post) = store.post_mut(&view.post_id) {
                    post.counts.views.apply_confirmed(1);
                }
            }
        }
        EventKind::FollowerCreated(f) | EventKind::FollowRemoved(f) => {
            let created = matches!(event.kind, EventKind::FollowerCreated(_));
            let delta = if created { 1 } else { -1 };
            if count {
                if let Some(followed) = store.user_mut(&f.followed_id) {
                    followed.counts.followers.apply_confirmed(delta);
                }
            }
            // The follower's "following" count is never predicted.
            if let Some(follower) = store.user_mut(&f.follower_id) {
                follower.counts.following.apply_confirmed(delta);
            }
            if own_relation {
                store.set_following(&f.followed_id, Some(created));
            }
            if let Some(list) = store.followers_mut(&f.followed_id) {
                if created {
                    let profile = f
                        .follower
                        .clone()
                        .map(UserProfile::from)
                        .unwrap_or_else(|| UserProfile::new(f.follower_id.clone()));
                    list.prepend(profile);
                } else {
                    list.remove(&f.follower_id);
                }
            }
        }
        EventKind::Notification(notification) => {
            store.push_notification(notification.clone());
        }
        EventKind::CommentTyping(_) | EventKind::CommentStopTyping(_) => {}
    }
}
