//! Valkey/Redis store implementation

use super::config::ValkeyConfig;
use super::{
    keys, ClientStore, DuplicateStore, SessionStore, Store, StoreError, UserIndexStore, MARKER_TTL,
    SESSION_TTL,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type CommandFuture<T> = Pin<Box<dyn Future<Output = Result<T, RedisError>> + Send>>;

/// Valkey/Redis store
///
/// Holds a fixed pool of `pool_size` multiplexed [`ConnectionManager`]s used
/// round-robin. The first `min_idle` are connected during
/// [`ValkeyStore::connect`]; the others are dialled on first use. Each
/// manager reconnects on its own after a dropped connection.
///
/// Every command is bounded by the command timeout and retried with a
/// doubling backoff. All commands are raced against a shutdown token;
/// cancelling it (see [`ValkeyStore::shutdown`]) makes in-flight and future
/// commands fail with [`StoreError::Cancelled`].
///
/// # Example
///
/// ```no_run
/// use acct_server::store::{Store, ValkeyConfig, ValkeyStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ValkeyConfig::new("localhost", 6379).with_password("secret");
/// let store = ValkeyStore::connect(config).await?;
/// store.ping().await?;
/// # Ok(())
/// # }
/// ```
pub struct ValkeyStore {
    client: Client,
    slots: Vec<OnceCell<ConnectionManager>>,
    next: AtomicUsize,
    config: ValkeyConfig,
    shutdown: CancellationToken,
}

impl ValkeyStore {
    /// Create the store and open the eager part of the pool
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` for unusable parameters. A server that is
    /// unreachable at startup is not an error: the failure is logged and the
    /// connection is retried on first use.
    pub async fn connect(config: ValkeyConfig) -> Result<Self, StoreError> {
        if config.host.is_empty() {
            return Err(StoreError::Config("empty host".to_string()));
        }
        if config.pool_size == 0 {
            return Err(StoreError::Config("pool size must be at least 1".to_string()));
        }

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.db,
                password: Some(config.password.clone()).filter(|p| !p.is_empty()),
                ..Default::default()
            },
        };
        let client = Client::open(info)
            .map_err(|e| StoreError::Config(format!("invalid connection parameters: {}", e)))?;

        let slots = (0..config.pool_size).map(|_| OnceCell::new()).collect();
        let store = Self {
            client,
            slots,
            next: AtomicUsize::new(0),
            config,
            shutdown: CancellationToken::new(),
        };

        for index in 0..store.config.min_idle.min(store.config.pool_size) {
            if let Err(e) = store.slot(index).await {
                warn!(error = %e, slot = index, "Initial store connection failed");
            }
        }

        Ok(store)
    }

    /// Cancel every in-flight and future command
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn slot(&self, index: usize) -> Result<ConnectionManager, StoreError> {
        let connect_timeout = self.config.connect_timeout();
        self.slots[index]
            .get_or_try_init(|| async {
                let manager = tokio::time::timeout(
                    connect_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                .map_err(|_| StoreError::Unavailable("connect timed out".to_string()))??;
                debug!(slot = index, "Store connection established");
                Ok::<_, StoreError>(manager)
            })
            .await
            .cloned()
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slot(index).await
    }

    /// Execute a command with timeout, retry and shutdown handling
    async fn with_retry<F, T>(&self, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(ConnectionManager) -> CommandFuture<T> + Send,
        T: Send,
    {
        let attempts = async {
            let mut last_error = StoreError::Unavailable(format!("{}: no attempt made", op));

            for attempt in 0..=self.config.max_retries {
                let outcome = match self.connection().await {
                    Ok(conn) => {
                        match tokio::time::timeout(self.config.command_timeout(), f(conn)).await {
                            Ok(Ok(value)) => return Ok(value),
                            Ok(Err(e)) if !is_retryable(&e) => return Err(StoreError::from(e)),
                            Ok(Err(e)) => StoreError::from(e),
                            Err(_) => StoreError::Unavailable(format!("{} timed out", op)),
                        }
                    }
                    Err(e) => e,
                };

                debug!(op, attempt, error = %outcome, "Store command failed");
                last_error = outcome;

                if attempt < self.config.max_retries {
                    tokio::time::sleep(self.config.retry_delay(attempt)).await;
                }
            }

            Err(last_error)
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(StoreError::Cancelled),
            result = attempts => result,
        }
    }
}

fn is_retryable(err: &RedisError) -> bool {
    err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal()
}

#[async_trait]
impl ClientStore for ValkeyStore {
    async fn client_secret(&self, ip: &str) -> Result<Option<String>, StoreError> {
        let key = keys::client(ip);

        let secret: Option<String> = self
            .with_retry("hget client", |mut conn| {
                let key = key.clone();
                Box::pin(async move { conn.hget(key, "secret").await })
            })
            .await?;

        Ok(secret.filter(|s| !s.is_empty()))
    }
}

#[async_trait]
impl SessionStore for ValkeyStore {
    async fn session_exists(&self, uuid: &str) -> Result<bool, StoreError> {
        let key = keys::session(uuid);

        self.with_retry("exists session", |mut conn| {
            let key = key.clone();
            Box::pin(async move { conn.exists(key).await })
        })
        .await
    }

    async fn session_get(&self, uuid: &str) -> Result<HashMap<String, String>, StoreError> {
        let key = keys::session(uuid);

        let fields: HashMap<String, String> = self
            .with_retry("hgetall session", |mut conn| {
                let key = key.clone();
                Box::pin(async move { conn.hgetall(key).await })
            })
            .await?;

        // HGETALL on a missing key yields an empty map.
        if fields.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(fields)
    }

    async fn session_merge(
        &self,
        uuid: &str,
        fields: &[(&'static str, String)],
    ) -> Result<(), StoreError> {
        let key = keys::session(uuid);
        let fields = fields.to_vec();
        let ttl_secs = SESSION_TTL.as_secs() as i64;

        self.with_retry("merge session", |mut conn| {
            let key = key.clone();
            let fields = fields.clone();
            Box::pin(async move {
                redis::pipe()
                    .atomic()
                    .hset_multiple(&key, &fields)
                    .ignore()
                    .expire(&key, ttl_secs)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
        })
        .await
    }

    async fn session_delete(&self, uuid: &str) -> Result<(), StoreError> {
        let key = keys::session(uuid);

        self.with_retry("del session", |mut conn| {
            let key = key.clone();
            Box::pin(async move { conn.del(key).await })
        })
        .await
    }
}

#[async_trait]
impl DuplicateStore for ValkeyStore {
    async fn marker_get(&self, acct_session_id: &str) -> Result<Option<String>, StoreError> {
        let key = keys::marker(acct_session_id);

        self.with_retry("get marker", |mut conn| {
            let key = key.clone();
            Box::pin(async move { conn.get(key).await })
        })
        .await
    }

    async fn marker_set(&self, acct_session_id: &str, value: &str) -> Result<(), StoreError> {
        let key = keys::marker(acct_session_id);
        let value = value.to_string();
        let ttl_secs = MARKER_TTL.as_secs();

        self.with_retry("set marker", |mut conn| {
            let key = key.clone();
            let value = value.clone();
            Box::pin(async move { conn.set_ex(key, value, ttl_secs).await })
        })
        .await
    }
}

#[async_trait]
impl UserIndexStore for ValkeyStore {
    async fn user_index_remove(&self, imsi: &str, uuid: &str) -> Result<(), StoreError> {
        let key = keys::user_index(imsi);
        let member = uuid.to_string();

        self.with_retry("srem user index", |mut conn| {
            let key = key.clone();
            let member = member.clone();
            Box::pin(async move { conn.srem(key, member).await })
        })
        .await
    }
}

#[async_trait]
impl Store for ValkeyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.with_retry("ping", |mut conn| {
            Box::pin(async move { redis::cmd("PING").query_async(&mut conn).await })
        })
        .await
    }
}

impl std::fmt::Debug for ValkeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyStore")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("db", &self.config.db)
            .field("pool_size", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // These tests require a running Valkey/Redis instance
    // Run with: docker run -d -p 6379:6379 valkey/valkey:latest

    async fn create_test_store() -> ValkeyStore {
        ValkeyStore::connect(ValkeyConfig::new("localhost", 6379).with_db(15))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_empty_pool() {
        let config = ValkeyConfig::new("localhost", 6379).with_pool_size(0);
        assert!(matches!(
            ValkeyStore::connect(config).await,
            Err(StoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_commands() {
        // Nothing listens on port 1; with no eager connections the command
        // would otherwise sit in retry backoff.
        let config = ValkeyConfig::new("127.0.0.1", 1)
            .with_min_idle(0)
            .with_max_retries(10);
        let store = ValkeyStore::connect(config).await.unwrap();
        store.shutdown();
        assert_eq!(store.ping().await, Err(StoreError::Cancelled));
    }

    #[tokio::test]
    #[ignore] // Requires Valkey server
    async fn test_connection() {
        let store = create_test_store().await;
        store.ping().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Valkey server
    async fn test_session_merge_sets_ttl() {
        let store = create_test_store().await;

        store
            .session_merge("ttl-test", &[("acct_id", "sess-1".to_string())])
            .await
            .unwrap();

        let mut conn = store.connection().await.unwrap();
        let ttl: i64 = conn.ttl(keys::session("ttl-test")).await.unwrap();
        assert!(ttl > (SESSION_TTL - Duration::from_secs(10)).as_secs() as i64);

        store.session_delete("ttl-test").await.unwrap();
        assert_eq!(store.session_get("ttl-test").await, Err(StoreError::NotFound));
    }

    #[tokio::test]
    #[ignore] // Requires Valkey server
    async fn test_marker_roundtrip() {
        let store = create_test_store().await;

        store.marker_set("valkey-test", "interim:1:2").await.unwrap();
        assert_eq!(
            store.marker_get("valkey-test").await.unwrap(),
            Some("interim:1:2".to_string())
        );
        assert_eq!(store.marker_get("valkey-test-absent").await.unwrap(), None);
    }
}
