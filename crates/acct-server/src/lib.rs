//! RADIUS Accounting Server for EAP-AKA deployments
//!
//! Receives RADIUS Accounting-Request and Status-Server datagrams,
//! authenticates them against per-NAS shared secrets, suppresses
//! retransmissions and mirrors the session lifecycle into the Valkey store
//! shared with the authentication server.
//!
//! # Example
//!
//! ```rust,no_run
//! use acct_server::{AcctServer, AuditLogger, PacketHandler};
//! use acct_server::store::MemoryStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryStore::new();
//!     store.insert_client("192.168.1.1", "testing123").await;
//!
//!     let handler = PacketHandler::new(
//!         Arc::new(store),
//!         Arc::new(AuditLogger::disabled()),
//!         None,
//!         true,
//!     );
//!
//!     let server = AcctServer::bind("0.0.0.0:1813".parse()?, handler).await?;
//!     server.run(CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod accounting;
pub mod audit;
pub mod config;
pub mod duplicate;
pub mod identifier;
pub mod logging;
pub mod server;
pub mod session;
pub mod store;

pub use accounting::AccountingProcessor;
pub use audit::{AuditEntry, AuditLogger, EventId, PacketContext};
pub use config::{Config, ConfigError, LogFormat};
pub use duplicate::{DuplicateDetector, Marker, SequenceReason, Verdict};
pub use identifier::IdentifierResolver;
pub use server::{AcctServer, PacketHandler, ServerError};
pub use session::{Session, SessionMirror};
pub use store::{Store, StoreError};
