use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{LinkBatch, TargetStore, WriteBatch};
use crate::error::StoreError;
use crate::model::{EntityId, EntityKind, LinkKind, RelationshipLink, StoredEntity};

#[derive(Default)]
struct MemoryState {
    next_entity_id: EntityId,
    next_link_id: i64,
    entities: BTreeMap<EntityId, StoredEntity>,
    links: BTreeMap<i64, RelationshipLink>,
}

/// In-process destination with the same contract as the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entity as if another system had created it.
    pub async fn insert(&self, mut entity: StoredEntity) -> EntityId {
        let mut state = self.state.lock().await;
        state.next_entity_id += 1;
        let id = state.next_entity_id;
        entity.id = Some(id);
        state.entities.insert(id, entity);
        id
    }

    /// Copy of every entity and link in `source`, ids preserved. Later
    /// writes get ids past the highest copied one.
    pub async fn seeded_from(source: &dyn TargetStore) -> Result<Self, StoreError> {
        let mut state = MemoryState::default();
        for kind in EntityKind::ALL {
            for entity in source.scan(kind).await? {
                let id = entity
                    .id
                    .ok_or_else(|| StoreError::Corrupt(format!("scanned {kind} without an id")))?;
                state.next_entity_id = state.next_entity_id.max(id);
                state.entities.insert(id, entity);
            }
        }
        for kind in LinkKind::ALL {
            for link in source.scan_links(kind).await? {
                let id = link
                    .id
                    .ok_or_else(|| StoreError::Corrupt(format!("scanned {kind} link without an id")))?;
                state.next_link_id = state.next_link_id.max(id);
                state.links.insert(id, link);
            }
        }
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Every entity and link, for comparing end states in tests.
    pub async fn snapshot(&self) -> (Vec<StoredEntity>, Vec<RelationshipLink>) {
        let state = self.state.lock().await;
        (
            state.entities.values().cloned().collect(),
            state.links.values().cloned().collect(),
        )
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn scan(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect())
    }

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.entities.values().filter(|e| e.kind == kind).count() as u64)
    }

    async fn count_migrated(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .values()
            .filter(|e| e.kind == kind && e.import.is_some())
            .count() as u64)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<Vec<EntityId>, StoreError> {
        let mut state = self.state.lock().await;
        // Validate first so a bad update leaves the store untouched.
        for update in &batch.updates {
            let id = update
                .id
                .ok_or_else(|| StoreError::Corrupt(format!("update of unsaved {}", update.kind)))?;
            if !state.entities.contains_key(&id) {
                return Err(StoreError::Corrupt(format!("{} {id} does not exist", update.kind)));
            }
        }
        let mut ids = Vec::with_capacity(batch.creates.len());
        for mut entity in batch.creates {
            state.next_entity_id += 1;
            let id = state.next_entity_id;
            entity.id = Some(id);
            state.entities.insert(id, entity);
            ids.push(id);
        }
        for update in batch.updates {
            if let Some(id) = update.id {
                state.entities.insert(id, update);
            }
        }
        Ok(ids)
    }

    async fn scan_links(&self, kind: LinkKind) -> Result<Vec<RelationshipLink>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .values()
            .filter(|l| l.kind == kind)
            .cloned()
            .collect())
    }

    async fn count_links(&self, kind: LinkKind) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.links.values().filter(|l| l.kind == kind).count() as u64)
    }

    async fn apply_links(&self, batch: LinkBatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        // Check pair uniqueness against the post-update state before mutating.
        let mut pairs: HashSet<LinkPair> = state.links.values().map(pair_of).collect();
        for link in &batch.updates {
            let id = link
                .id
                .ok_or_else(|| StoreError::Corrupt(format!("update of unsaved {} link", link.kind)))?;
            let current = state
                .links
                .get(&id)
                .ok_or_else(|| StoreError::Corrupt(format!("{} link {id} does not exist", link.kind)))?;
            pairs.remove(&pair_of(current));
        }
        for link in batch.updates.iter().chain(&batch.creates) {
            if !pairs.insert(pair_of(link)) {
                return Err(StoreError::Corrupt(format!(
                    "duplicate {} link {} -> {}",
                    link.kind, link.subject_id, link.object_id
                )));
            }
        }

        for link in batch.updates {
            if let Some(id) = link.id {
                state.links.insert(id, link);
            }
        }
        for mut link in batch.creates {
            state.next_link_id += 1;
            let id = state.next_link_id;
            link.id = Some(id);
            state.links.insert(id, link);
        }
        Ok(())
    }
}

type LinkPair = (LinkKind, EntityId, EntityId);

fn pair_of(link: &RelationshipLink) -> LinkPair {
    (link.kind, link.subject_id, link.object_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinkStatus;
    use chrono::Utc;

    fn link(subject: EntityId, object: EntityId) -> RelationshipLink {
        RelationshipLink {
            id: None,
            kind: LinkKind::PatientReferrer,
            subject_id: subject,
            object_id: object,
            status: LinkStatus::Active,
            relationship_date: None,
            is_primary: false,
            reason: None,
            external_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn creates_get_sequential_ids() {
        let store = MemoryStore::new();
        let entity = StoredEntity {
            id: None,
            kind: EntityKind::Company,
            created_at: Utc::now(),
            body: serde_json::json!({"name": "Acme"}),
            import: None,
        };
        let ids = store
            .apply(WriteBatch {
                creates: vec![entity.clone(), entity],
                updates: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.count(EntityKind::Company).await.unwrap(), 2);
        assert_eq!(store.count_migrated(EntityKind::Company).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_link_pairs_are_rejected() {
        let store = MemoryStore::new();
        store
            .apply_links(LinkBatch {
                creates: vec![link(1, 2)],
                updates: Vec::new(),
            })
            .await
            .unwrap();
        let err = store
            .apply_links(LinkBatch {
                creates: vec![link(1, 2)],
                updates: Vec::new(),
            })
            .await;
        assert!(err.is_err());
        assert_eq!(store.count_links(LinkKind::PatientReferrer).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn updates_free_their_old_pair_before_creates_land() {
        let store = MemoryStore::new();
        store
            .apply_links(LinkBatch {
                creates: vec![link(1, 10)],
                updates: Vec::new(),
            })
            .await
            .unwrap();
        let mut moved = store.scan_links(LinkKind::PatientReferrer).await.unwrap().remove(0);
        moved.object_id = 11;
        store
            .apply_links(LinkBatch {
                creates: vec![link(1, 10)],
                updates: vec![moved],
            })
            .await
            .unwrap();

        let mut pairs: Vec<_> = store
            .scan_links(LinkKind::PatientReferrer)
            .await
            .unwrap()
            .into_iter()
            .map(|l| (l.id, l.subject_id, l.object_id))
            .collect();
        pairs.sort();
        assert_eq!(pairs, vec![(Some(1), 1, 11), (Some(2), 1, 10)]);
    }

    #[tokio::test]
    async fn a_rejected_link_batch_writes_nothing() {
        let store = MemoryStore::new();
        let mut ghost = link(5, 6);
        ghost.id = Some(99);
        let err = store
            .apply_links(LinkBatch {
                creates: vec![link(1, 2)],
                updates: vec![ghost],
            })
            .await;
        assert!(err.is_err());
        assert_eq!(store.count_links(LinkKind::PatientReferrer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn seeded_copy_keeps_ids_and_continues_past_them() {
        let source = MemoryStore::new();
        let entity = StoredEntity {
            id: None,
            kind: EntityKind::Patient,
            created_at: Utc::now(),
            body: serde_json::json!({"first_name": "Ann"}),
            import: None,
        };
        let first = source.insert(entity.clone()).await;
        let second = source.insert(entity.clone()).await;

        let copy = MemoryStore::seeded_from(&source).await.unwrap();
        let ids = copy
            .apply(WriteBatch {
                creates: vec![entity],
                updates: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(ids, vec![second + 1]);
        assert_eq!(copy.count(EntityKind::Patient).await.unwrap(), 3);
        assert_eq!(source.count(EntityKind::Patient).await.unwrap(), 2);
        assert!(copy.scan(EntityKind::Patient).await.unwrap().iter().any(|e| e.id == Some(first)));
    }
}
