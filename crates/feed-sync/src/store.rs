/// Feed aggregate store
/// Composed view models: the post feed, per-post comment lists, the user
/// directory and per-user follower lists, plus notifications and the
/// viewed-post set. Lists de-duplicate by id and page with a monotonic
/// offset cursor.
use feed_model::{Comment, CommentId, Notification, Post, PostId, UserId, UserProfile};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::{FeedConfig, KeyValueStore, ViewedPosts};

pub trait FeedItem {
    type Id: Clone + Eq + Hash + Debug;

    fn id(&self) -> &Self::Id;

    /// Last-writer-wins merge of a fresher copy of the same entity.
    fn merge(&mut self, incoming: Self);
}

impl FeedItem for Post {
    type Id = PostId;

    fn id(&self) -> &PostId {
        &self.id
    }

    fn merge(&mut self, incoming: Self) {
        self.merge_from(incoming);
    }
}

impl FeedItem for Comment {
    type Id = CommentId;

    fn id(&self) -> &CommentId {
        &self.id
    }

    fn merge(&mut self, incoming: Self) {
        self.merge_from(incoming);
    }
}

impl FeedItem for UserProfile {
    type Id = UserId;

    fn id(&self) -> &UserId {
        &self.id
    }

    fn merge(&mut self, incoming: Self) {
        self.merge_from(incoming);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub offset: usize,
    pub limit: usize,
    // Bumped whenever the owning list restarts pagination.
    generation: u64,
}

impl PageCursor {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            generation: 0,
        }
    }
}

/// Outcome of applying one fetched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub inserted: usize,
    pub next_cursor: PageCursor,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct FeedList<T: FeedItem> {
    items: Vec<T>,
    cursor: PageCursor,
    has_more: bool,
    fetching: bool,
}

impl<T: FeedItem> FeedList<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            cursor: PageCursor::new(0, limit.max(1)),
            has_more: true,
            fetching: false,
        }
    }

    /// Claim the next page to fetch. `None` while a fetch is already running
    /// or once the end of the list has been reached.
    pub fn begin_fetch(&mut self) -> Option<PageCursor> {
        if self.fetching || !self.has_more {
            return None;
        }
        self.fetching = true;
        Some(self.cursor)
    }

    /// Release a claimed fetch without applying anything (request failed).
    pub fn cancel_fetch(&mut self) {
        self.fetching = false;
    }

    /// Apply a page fetched at `cursor`. Items already present are merged
    /// in place; a short page ends pagination for good. A page fetched
    /// before a `reset` or `replace_with_page` is dropped. Items prepended
    /// while the fetch was running have already shifted the offset, so the
    /// page advances from the live cursor.
    pub fn apply_page(&mut self, cursor: PageCursor, items: Vec<T>) -> Page {
        if !self.is_current(&cursor) {
            return Page {
                inserted: 0,
                next_cursor: self.cursor,
                has_more: self.has_more,
            };
        }

        self.fetching = false;
        let received = items.len();
        let mut inserted = 0;
        for item in items {
            if self.upsert(item) {
                inserted += 1;
            }
        }

        self.cursor.offset += received;
        if received < cursor.limit {
            self.has_more = false;
        }

        Page {
            inserted,
            next_cursor: self.cursor,
            has_more: self.has_more,
        }
    }

    /// Restart pagination from a freshly fetched first page. Entities still
    /// present keep their local state (pending predictions, relation flags)
    /// and take the fresh server fields; everything else is dropped.
    pub fn replace_with_page(&mut self, items: Vec<T>) -> Page {
        let mut previous = std::mem::take(&mut self.items);
        let received = items.len();

        for item in items {
            if self.position(item.id()).is_some() {
                continue;
            }
            match previous.iter().position(|old| old.id() == item.id()) {
                Some(index) => {
                    let mut kept = previous.swap_remove(index);
                    kept.merge(item);
                    self.items.push(kept);
                }
                None => self.items.push(item),
            }
        }

        self.cursor.offset = received;
        self.cursor.generation += 1;
        // The end of the list, once seen, stays reached.
        self.has_more = self.has_more && received >= self.cursor.limit;
        self.fetching = false;

        Page {
            inserted: self.items.len(),
            next_cursor: self.cursor,
            has_more: self.has_more,
        }
    }

    /// Whether a page fetched at `cursor` would still be applied.
    pub fn is_current(&self, cursor: &PageCursor) -> bool {
        cursor.generation == self.cursor.generation && cursor.limit == self.cursor.limit
    }

    /// Merge by id, appending when the item is new. Returns true on insert.
    pub fn upsert(&mut self, item: T) -> bool {
        match self.position(item.id()) {
            Some(index) => {
                self.items[index].merge(item);
                false
            }
            None => {
                self.items.push(item);
                true
            }
        }
    }

    /// Merge only when the item is already present.
    pub fn merge_existing(&mut self, item: T) -> bool {
        match self.position(item.id()) {
            Some(index) => {
                self.items[index].merge(item);
                true
            }
            None => false,
        }
    }

    /// Insert a newly created entity at the top. A second arrival of the same
    /// id is ignored, so a request response and its broadcast apply once.
    pub fn prepend(&mut self, item: T) -> bool {
        if self.position(item.id()).is_some() {
            return false;
        }
        self.items.insert(0, item);
        // Server-side offsets shift by one as well.
        self.cursor.offset += 1;
        true
    }

    pub fn remove(&mut self, id: &T::Id) -> Option<T> {
        self.position(id).map(|index| self.items.remove(index))
    }

    pub fn reset(&mut self) {
        self.items.clear();
        self.cursor.offset = 0;
        self.cursor.generation += 1;
        self.has_more = true;
        self.fetching = false;
    }

    pub fn get(&self, id: &T::Id) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn get_mut(&mut self, id: &T::Id) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.id() == id)
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.position(id).is_some()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cursor(&self) -> PageCursor {
        self.cursor
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching
    }

    fn position(&self, id: &T::Id) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }
}

pub struct FeedStore {
    pub posts: FeedList<Post>,
    pub users: FeedList<UserProfile>,
    comments: HashMap<PostId, FeedList<Comment>>,
    followers: HashMap<UserId, FeedList<UserProfile>>,
    notifications: Vec<Notification>,
    notification_ids: HashSet<String>,
    viewed: ViewedPosts,
    page_size: usize,
    comment_page_size: usize,
}

impl FeedStore {
    pub fn new(page_size: usize, comment_page_size: usize, viewed: ViewedPosts) -> Self {
        Self {
            posts: FeedList::new(page_size),
            users: FeedList::new(page_size),
            comments: HashMap::new(),
            followers: HashMap::new(),
            notifications: Vec::new(),
            notification_ids: HashSet::new(),
            viewed,
            page_size,
            comment_page_size,
        }
    }

    pub fn from_config(config: &FeedConfig, backend: Arc<dyn KeyValueStore>) -> Self {
        let viewed = ViewedPosts::load(backend, config.viewed_capacity);
        Self::new(config.page_size, config.comment_page_size, viewed)
    }

    pub fn post(&self, id: &PostId) -> Option<&Post> {
        self.posts.get(id)
    }

    pub fn post_mut(&mut self, id: &PostId) -> Option<&mut Post> {
        self.posts.get_mut(id)
    }

    /// Drop a post and everything hanging off it.
    pub fn remove_post(&mut self, id: &PostId) -> Option<Post> {
        self.comments.remove(id);
        self.posts.remove(id)
    }

    /// A user profile, looked up in the directory first and then in any
    /// loaded follower list.
    pub fn user(&self, id: &UserId) -> Option<&UserProfile> {
        self.users
            .get(id)
            .or_else(|| self.followers.values().find_map(|list| list.get(id)))
    }

    pub fn user_mut(&mut self, id: &UserId) -> Option<&mut UserProfile> {
        if self.users.contains(id) {
            return self.users.get_mut(id);
        }
        self.followers
            .values_mut()
            .find_map(|list| list.get_mut(id))
    }

    /// Set the follow flag on every loaded copy of a profile.
    pub fn set_following(&mut self, id: &UserId, following: Option<bool>) {
        if let Some(user) = self.users.get_mut(id) {
            user.following = following;
        }
        for list in self.followers.values_mut() {
            if let Some(user) = list.get_mut(id) {
                user.following = following;
            }
        }
    }

    pub fn comments(&self, post_id: &PostId) -> Option<&FeedList<Comment>> {
        self.comments.get(post_id)
    }

    /// The comment list of a post, only if it has been opened.
    pub fn comments_mut(&mut self, post_id: &PostId) -> Option<&mut FeedList<Comment>> {
        self.comments.get_mut(post_id)
    }

    /// Open (or return) the comment list of a post.
    pub fn open_comments(&mut self, post_id: &PostId) -> &mut FeedList<Comment> {
        let limit = self.comment_page_size;
        self.comments
            .entry(post_id.clone())
            .or_insert_with(|| FeedList::new(limit))
    }

    /// Find which loaded list holds a comment.
    pub fn comment_owner(&self, comment_id: &CommentId) -> Option<PostId> {
        self.comments
            .iter()
            .find(|(_, list)| list.contains(comment_id))
            .map(|(post_id, _)| post_id.clone())
    }

    pub fn followers(&self, user_id: &UserId) -> Option<&FeedList<UserProfile>> {
        self.followers.get(user_id)
    }

    pub fn followers_mut(&mut self, user_id: &UserId) -> Option<&mut FeedList<UserProfile>> {
        self.followers.get_mut(user_id)
    }

    pub fn open_followers(&mut self, user_id: &UserId) -> &mut FeedList<UserProfile> {
        let limit = self.page_size;
        self.followers
            .entry(user_id.clone())
            .or_insert_with(|| FeedList::new(limit))
    }

    /// Newest first. Returns false for a notification already held.
    pub fn push_notification(&mut self, notification: Notification) -> bool {
        if let Some(key) = notification.dedup_id() {
            if !self.notification_ids.insert(key) {
                return false;
            }
        }
        self.notifications.insert(0, notification);
        true
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    pub fn clear_notifications(&mut self) {
        self.notifications.clear();
        self.notification_ids.clear();
    }

    pub fn viewed(&self) -> &ViewedPosts {
        &self.viewed
    }

    pub fn viewed_mut(&mut self) -> &mut ViewedPosts {
        &mut self.viewed
    }
}

impl Default for FeedStore {
    fn default() -> Self {
        let config = FeedConfig::default();
        Self::new(
            config.page_size,
            config.comment_page_size,
            ViewedPosts::new(config.viewed_capacity),
        )
    }
}
