//! Persistent storage for the authority.
//!
//! ```text
//! ┌─────────────┐  snapshot + accepted mutations  ┌──────────────┐
//! │ Authority   │ ──────────────────────────────► │ DocumentStore│
//! │ (in-memory) │ ◄────────────────────────────── │ (RocksDB)    │
//! └─────────────┘        recover on startup       └──────┬───────┘
//!                                                        │ column families
//!                              ┌─────────────────────────┴──────────┐
//!                              │ "documents": full snapshots (LZ4) │
//!                              │ "mutations": accepted log (LZ4)   │
//!                              │ "metadata" : version, sizes       │
//!                              └────────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
