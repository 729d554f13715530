//! Destination store seam.
//!
//! The migration core only scans, counts and upserts; nothing here deletes.

pub mod memory;
pub mod scratch;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{EntityId, EntityKind, LinkKind, RelationshipLink, StoredEntity};

pub use memory::MemoryStore;
pub use scratch::ScratchStore;
pub use sqlite::Db;

/// Entities to write in one transaction.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub creates: Vec<StoredEntity>,
    pub updates: Vec<StoredEntity>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct LinkBatch {
    pub creates: Vec<RelationshipLink>,
    pub updates: Vec<RelationshipLink>,
}

impl LinkBatch {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty()
    }
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Every entity of a kind, in no particular order.
    async fn scan(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError>;

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError>;

    /// Entities of a kind that carry an import marker.
    async fn count_migrated(&self, kind: EntityKind) -> Result<u64, StoreError>;

    /// `bulk_create` then `bulk_update` inside one transaction. Returns the
    /// ids assigned to `batch.creates`, in order.
    async fn apply(&self, batch: WriteBatch) -> Result<Vec<EntityId>, StoreError>;

    async fn scan_links(&self, kind: LinkKind) -> Result<Vec<RelationshipLink>, StoreError>;

    async fn count_links(&self, kind: LinkKind) -> Result<u64, StoreError>;

    async fn apply_links(&self, batch: LinkBatch) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn TargetStore>;

/// Open the store named by a destination URL. `memory` selects the
/// in-process store.
pub async fn open(url: &str) -> anyhow::Result<SharedStore> {
    if url.trim().eq_ignore_ascii_case("memory") {
        tracing::warn!("using in-memory destination store; nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let db = Db::connect(url).await?;
    Ok(Arc::new(db))
}
