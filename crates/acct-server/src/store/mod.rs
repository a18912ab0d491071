//! Store gateway
//!
//! All accounting state lives in a shared key-value store that the
//! authentication server and the administration tooling also use. The
//! gateway exposes four narrow interfaces over it:
//!
//! - [`ClientStore`]: per-NAS shared secrets (read only)
//! - [`SessionStore`]: the session hash written by the authentication server
//! - [`DuplicateStore`]: the per Acct-Session-Id duplicate marker
//! - [`UserIndexStore`]: the IMSI to live-session index
//!
//! # Key layout
//!
//! ```text
//! client:<ip>                  hash, field "secret"
//! sess:<uuid>                  hash, TTL 24h
//! idx:user:<imsi>              set of session UUIDs
//! acct:seen:<acct-session-id>  string, TTL 24h
//! ```
//!
//! Two implementations are provided: [`ValkeyStore`] for deployments and
//! [`MemoryStore`] for tests and local runs.

pub mod config;
pub mod error;
pub mod memory;
pub mod valkey;

pub use config::ValkeyConfig;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use valkey::ValkeyStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Lifetime of a session hash, re-armed on every update
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetime of a duplicate marker, re-armed on every write
pub const MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Key builders for the shared schema
pub mod keys {
    pub fn client(ip: &str) -> String {
        format!("client:{}", ip)
    }

    pub fn session(uuid: &str) -> String {
        format!("sess:{}", uuid)
    }

    pub fn user_index(imsi: &str) -> String {
        format!("idx:user:{}", imsi)
    }

    pub fn marker(acct_session_id: &str) -> String {
        format!("acct:seen:{}", acct_session_id)
    }
}

/// Shared secrets of registered RADIUS clients
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Secret registered for a source address; `None` when the client is
    /// unknown or has an empty secret
    async fn client_secret(&self, ip: &str) -> Result<Option<String>, StoreError>;
}

/// Session hashes keyed by session UUID
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn session_exists(&self, uuid: &str) -> Result<bool, StoreError>;

    /// All fields of the session hash, `StoreError::NotFound` when absent
    async fn session_get(&self, uuid: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Merge `fields` into the hash and re-arm [`SESSION_TTL`] in one
    /// transaction
    async fn session_merge(
        &self,
        uuid: &str,
        fields: &[(&'static str, String)],
    ) -> Result<(), StoreError>;

    async fn session_delete(&self, uuid: &str) -> Result<(), StoreError>;
}

/// Duplicate markers keyed by Acct-Session-Id
#[async_trait]
pub trait DuplicateStore: Send + Sync {
    /// Current marker value, `None` when absent
    async fn marker_get(&self, acct_session_id: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite the marker and re-arm [`MARKER_TTL`]
    async fn marker_set(&self, acct_session_id: &str, value: &str) -> Result<(), StoreError>;
}

/// Per-subscriber index of live sessions
#[async_trait]
pub trait UserIndexStore: Send + Sync {
    async fn user_index_remove(&self, imsi: &str, uuid: &str) -> Result<(), StoreError>;
}

/// The full gateway
#[async_trait]
pub trait Store: ClientStore + SessionStore + DuplicateStore + UserIndexStore {
    /// Connectivity probe
    async fn ping(&self) -> Result<(), StoreError>;
}
