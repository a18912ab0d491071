//! In-memory store implementation

use super::{
    keys, ClientStore, DuplicateStore, SessionStore, Store, StoreError, UserIndexStore, MARKER_TTL,
    SESSION_TTL,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// In-memory store
///
/// Mirrors the key layout and TTL behaviour of the Valkey schema inside the
/// process. It provides no persistence and is not shared between server
/// instances.
///
/// # Use Cases
///
/// - Unit and integration tests
/// - Local development without a Valkey server
///
/// # Thread Safety
///
/// Uses `tokio::sync::RwLock` for concurrent access from multiple async tasks.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() >= expires_at)
            .unwrap_or(false)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn live(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    /// Register a RADIUS client secret
    pub async fn insert_client(&self, ip: &str, secret: &str) {
        let mut fields = HashMap::new();
        fields.insert("secret".to_string(), secret.to_string());
        let mut entries = self.entries.write().await;
        entries.insert(keys::client(ip), Entry::new(Value::Hash(fields), None));
    }

    /// Create a session hash the way the authentication server does
    pub async fn insert_session(&self, uuid: &str, fields: &[(&str, &str)]) {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut entries = self.entries.write().await;
        entries.insert(
            keys::session(uuid),
            Entry::new(Value::Hash(fields), Some(SESSION_TTL)),
        );
    }

    /// Add a session UUID to a subscriber's index
    pub async fn insert_user_index(&self, imsi: &str, uuid: &str) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(keys::user_index(imsi))
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new()), None));
        if let Value::Set(members) = &mut entry.value {
            members.insert(uuid.to_string());
        }
    }

    /// Members of a subscriber's index
    pub async fn user_index_members(&self, imsi: &str) -> Vec<String> {
        match self.live(&keys::user_index(imsi)).await {
            Some(Value::Set(members)) => {
                let mut members: Vec<String> = members.into_iter().collect();
                members.sort();
                members
            }
            _ => Vec::new(),
        }
    }

    /// Raw duplicate marker value
    pub async fn raw_marker(&self, acct_session_id: &str) -> Option<String> {
        match self.live(&keys::marker(acct_session_id)).await {
            Some(Value::String(value)) => Some(value),
            _ => None,
        }
    }

    /// Remaining lifetime of a key; `None` when absent or without expiry
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().await;
        let entry = entries.get(key).filter(|entry| !entry.is_expired())?;
        entry
            .expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }

    /// Sorted list of live keys
    pub async fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn client_secret(&self, ip: &str) -> Result<Option<String>, StoreError> {
        match self.live(&keys::client(ip)).await {
            Some(Value::Hash(fields)) => {
                Ok(fields.get("secret").filter(|s| !s.is_empty()).cloned())
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn session_exists(&self, uuid: &str) -> Result<bool, StoreError> {
        Ok(self.live(&keys::session(uuid)).await.is_some())
    }

    async fn session_get(&self, uuid: &str) -> Result<HashMap<String, String>, StoreError> {
        match self.live(&keys::session(uuid)).await {
            Some(Value::Hash(fields)) if !fields.is_empty() => Ok(fields),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn session_merge(
        &self,
        uuid: &str,
        fields: &[(&'static str, String)],
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let key = keys::session(uuid);

        let mut merged = match entries.remove(&key) {
            Some(Entry { value: Value::Hash(existing), .. }) => existing,
            _ => HashMap::new(),
        };
        for (field, value) in fields {
            merged.insert(field.to_string(), value.clone());
        }

        entries.insert(key, Entry::new(Value::Hash(merged), Some(SESSION_TTL)));
        Ok(())
    }

    async fn session_delete(&self, uuid: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.remove(&keys::session(uuid));
        Ok(())
    }
}

#[async_trait]
impl DuplicateStore for MemoryStore {
    async fn marker_get(&self, acct_session_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.raw_marker(acct_session_id).await)
    }

    async fn marker_set(&self, acct_session_id: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            keys::marker(acct_session_id),
            Entry::new(Value::String(value.to_string()), Some(MARKER_TTL)),
        );
        Ok(())
    }
}

#[async_trait]
impl UserIndexStore for MemoryStore {
    async fn user_index_remove(&self, imsi: &str, uuid: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let key = keys::user_index(imsi);
        let now_empty = match entries.get_mut(&key) {
            Some(Entry { value: Value::Set(members), .. }) => {
                members.remove(uuid);
                members.is_empty()
            }
            _ => false,
        };
        // An empty set does not exist in Valkey either.
        if now_empty {
            entries.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
