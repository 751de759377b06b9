//! keyflag-state: storage collaborators for the keyflag lifecycle engine.
//!
//! Backed by [redb](https://docs.rs/redb), provides the durable key store
//! (records, canary targets, accounts) together with the value cache and
//! deployment registry the engine reads through.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns and keyed
//! by a numeric id. Secondary tables use composite string keys
//! (`{path}\0{id}`, `{record_id}\0{host}`) so related rows are adjacent and
//! can be range-scanned by prefix.
//!
//! All mutations go through [`KeyTxn`], a thin wrapper over a redb write
//! transaction. redb admits one writer at a time, so a lookup followed by
//! an insert inside one `KeyTxn` is serializable. Dropping a `KeyTxn`
//! without committing aborts it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across request threads.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod cache;
pub mod error;
mod query;
pub mod registry;
pub mod store;
pub mod tables;
pub mod txn;

pub use cache::{MemoryCache, ValueCache};
pub use error::{CacheError, RegistryError, StateError, StateResult};
pub use registry::{DeploymentRegistry, StoreRegistry};
pub use store::StateStore;
pub use txn::KeyTxn;
