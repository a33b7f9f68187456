/// Local key-value persistence
/// Holds the session tokens and the set of posts this device has already
/// counted a view for. Everything is JSON on disk under the data directory.
use feed_model::{PostId, UserSummary};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{FeedError, Result};

pub const SESSION_KEY: &str = "session";
pub const VIEWED_POSTS_KEY: &str = "viewed_posts";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One JSON file per key inside `dir`.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    // Serializes writers within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path).map(Some).map_err(|e| {
            FeedError::StorageError(format!("Failed to read {}: {}", path.display(), e))
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        fs::create_dir_all(&self.dir).map_err(|e| {
            FeedError::StorageError(format!("Failed to create storage directory: {}", e))
        })?;
        let path = self.path_for(key);
        fs::write(&path, value).map_err(|e| {
            FeedError::StorageError(format!("Failed to write {}: {}", path.display(), e))
        })?;
        debug!("Saved {} to {}", key, path.display());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                FeedError::StorageError(format!("Failed to delete {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
}

/// Access/refresh token pair persisted across runs.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn load(&self) -> Result<Option<SessionTokens>> {
        match self.backend.get(SESSION_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, tokens: &SessionTokens) -> Result<()> {
        let raw = serde_json::to_string(tokens)?;
        self.backend.set(SESSION_KEY, &raw)
    }

    pub fn clear(&self) -> Result<()> {
        self.backend.remove(SESSION_KEY)
    }

    pub fn access_token(&self) -> Option<String> {
        match self.load() {
            Ok(tokens) => tokens.map(|t| t.access_token),
            Err(e) => {
                warn!("Ignoring unreadable session: {}", e);
                None
            }
        }
    }
}

/// Bounded, insertion-ordered set of posts this device already recorded a
/// view for. The oldest entry is evicted once `capacity` is reached.
pub struct ViewedPosts {
    order: VecDeque<PostId>,
    members: HashSet<PostId>,
    capacity: usize,
    backend: Option<Arc<dyn KeyValueStore>>,
}

impl ViewedPosts {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
            backend: None,
        }
    }

    /// Load the persisted set; an unreadable entry starts the set empty.
    pub fn load(backend: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        let mut viewed = Self::new(capacity);
        let saved: Vec<PostId> = match backend.get(VIEWED_POSTS_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Discarding corrupt viewed-posts entry: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to load viewed posts: {}", e);
                Vec::new()
            }
        };
        for id in saved {
            viewed.push(id);
        }
        viewed.backend = Some(backend);
        viewed
    }

    pub fn contains(&self, post_id: &PostId) -> bool {
        self.members.contains(post_id)
    }

    /// Returns false when the post was already present.
    pub fn insert(&mut self, post_id: PostId) -> bool {
        if !self.push(post_id) {
            return false;
        }
        self.persist();
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn push(&mut self, post_id: PostId) -> bool {
        if self.members.contains(&post_id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(post_id.clone());
        self.order.push_back(post_id);
        true
    }

    fn persist(&self) {
        let Some(backend) = &self.backend else {
            return;
        };
        let ids: Vec<&PostId> = self.order.iter().collect();
        let result = serde_json::to_string(&ids)
            .map_err(FeedError::from)
            .and_then(|raw| backend.set(VIEWED_POSTS_KEY, &raw));
        if let Err(e) = result {
            warn!("Failed to persist viewed posts: {}", e);
        }
    }
}
