use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use super::{LinkBatch, MemoryStore, SharedStore, TargetStore, WriteBatch};
use crate::error::StoreError;
use crate::model::{EntityId, EntityKind, LinkKind, RelationshipLink, StoredEntity};

/// Dry-run destination. The first access copies the real store into memory;
/// every later read and write goes to that copy, so phases see what earlier
/// phases would have written while the real store stays untouched.
pub struct ScratchStore {
    base: SharedStore,
    copy: OnceCell<MemoryStore>,
}

impl ScratchStore {
    pub fn new(base: SharedStore) -> Self {
        Self {
            base,
            copy: OnceCell::new(),
        }
    }

    async fn copy(&self) -> Result<&MemoryStore, StoreError> {
        self.copy
            .get_or_try_init(|| async {
                let copy = MemoryStore::seeded_from(self.base.as_ref()).await?;
                info!("dry run: destination copied into a scratch store");
                Ok::<_, StoreError>(copy)
            })
            .await
    }
}

#[async_trait]
impl TargetStore for ScratchStore {
    async fn scan(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError> {
        self.copy().await?.scan(kind).await
    }

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        self.copy().await?.count(kind).await
    }

    async fn count_migrated(&self, kind: EntityKind) -> Result<u64, StoreError> {
        self.copy().await?.count_migrated(kind).await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<Vec<EntityId>, StoreError> {
        self.copy().await?.apply(batch).await
    }

    async fn scan_links(&self, kind: LinkKind) -> Result<Vec<RelationshipLink>, StoreError> {
        self.copy().await?.scan_links(kind).await
    }

    async fn count_links(&self, kind: LinkKind) -> Result<u64, StoreError> {
        self.copy().await?.count_links(kind).await
    }

    async fn apply_links(&self, batch: LinkBatch) -> Result<(), StoreError> {
        self.copy().await?.apply_links(batch).await
    }
}
