//! # mapsync-collab: Local-first synchronisation of feature collections
//!
//! ## Architecture
//!
//! ```text
//!  UI code ──► Persistence (port)
//!                 ├── LocalPersistence   in-memory, no backend
//!                 └── SyncClient         one driver task per document
//!                        │  pull / push           ▲ poke
//!                        ▼                        │
//!                     Remote ── LoopbackRemote ───┤ (in-process)
//!                        └───── WsRemote ─────────┤ (WebSocket)
//!                                                 │
//!                     SyncServer ──► Authority ── PokeHub
//!                                       │
//!                                  DocumentStore (RocksDB + LZ4)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`persistence`]: The persistence port and the in-memory backend
//! - [`client`]: Synced backend: optimistic apply, push, reconcile
//! - [`remote`]: Client-side transports to the authority
//! - [`authority`]: Versioned server of record with push dedup
//! - [`poke`]: Per-document poke fan-out
//! - [`server`]: WebSocket endpoints `/api/sync` and `/api/poke`
//! - [`storage`]: RocksDB document store

pub mod authority;
pub mod client;
pub mod persistence;
pub mod poke;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use authority::{Authority, AuthorityConfig, AuthorityError, AuthorityStats};
pub use client::{RetryPolicy, SyncClient, SyncConfig};
pub use persistence::{
    LocalPersistence, MutationReceipt, Persistence, PersistenceError, Snapshot, SnapshotStream,
    SyncEvent, SyncStatus,
};
pub use poke::{PokeGroup, PokeHub, PokeStats, PokeSubscription};
pub use protocol::{
    MessageType, MutationOutcome, MutationStatus, ProtocolError, PushAck, PushRequest, SyncMessage,
};
pub use remote::{LoopbackRemote, NetworkError, PokeStream, Remote, WsRemote};
pub use server::{parse_route, Route, RouteError, ServerConfig, ServerStats, SyncServer};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
