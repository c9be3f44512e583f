//! Durable canvas-object storage.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  fetch_live_ids / mark_deleted / upsert  ┌──────────────────┐
//! │ Reconciler  │ ───────────────────────────────────────► │ dyn ObjectStore  │
//! └─────────────┘                                          └────────┬─────────┘
//!                                                 ┌─────────────────┴──────────┐
//!                                                 ▼                            ▼
//!                                      ┌────────────────────┐      ┌──────────────────────┐
//!                                      │ MemoryObjectStore  │      │ RocksObjectStore     │
//!                                      │ (HashMap + RwLock) │      │ CF "objects"  (LZ4)  │
//!                                      └────────────────────┘      │ CF "scopes"   (index)│
//!                                                                  └──────────────────────┘
//! ```
//!
//! Deletion is logical: `mark_deleted` flips the tombstone flag and keeps
//! the row. Only `purge_tombstones` removes rows physically.

pub mod memory;
pub mod rocks;

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use vellum_core::{CanvasObject, DesignScope, LocalObject, ObjectId};

pub use memory::MemoryObjectStore;
pub use rocks::{RocksObjectStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Object not found: {0}")]
    NotFound(ObjectId),
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Store operations the reconciler relies on.
///
/// Implementations must keep object ids unique across scopes: an upsert of
/// an id owned by another scope is `PersistenceError::Rejected`.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Ids of the non-deleted objects in a scope.
    async fn fetch_live_ids(&self, scope: DesignScope) -> Result<HashSet<ObjectId>, PersistenceError>;

    /// Tombstone every listed live object of the scope. Returns how many
    /// rows changed; unknown or already-deleted ids are skipped.
    async fn mark_deleted(
        &self,
        scope: DesignScope,
        ids: &[ObjectId],
        at: u64,
    ) -> Result<usize, PersistenceError>;

    /// Create the row if absent, otherwise overwrite it and clear its tombstone.
    async fn upsert(
        &self,
        scope: DesignScope,
        object: &LocalObject,
        at: u64,
    ) -> Result<UpsertOutcome, PersistenceError>;

    async fn get(&self, id: &ObjectId) -> Result<Option<CanvasObject>, PersistenceError>;

    /// Every row of a scope, tombstones included.
    async fn load_scope(&self, scope: DesignScope) -> Result<Vec<CanvasObject>, PersistenceError>;

    /// Physically remove tombstones last updated before `older_than`.
    async fn purge_tombstones(&self, older_than: u64) -> Result<usize, PersistenceError>;
}
