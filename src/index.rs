//! Phase-scoped lookup index over already-imported destination entities.
//!
//! An [`EntitySet`] is built from a full scan of one entity kind at phase
//! start, answers external-id and natural-key lookups in O(1), and tracks
//! which entities the phase created or changed so they can be written in
//! bulk. It is never persisted and never shared between phases.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{Entity, EntityId, ImportMetadata, KeyIndex, NaturalKey, StoredEntity, TargetEntity};
use crate::normalization::Normalizer;
use crate::store::{TargetStore, WriteBatch};

/// Which entity keeps a key when two entities normalize to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// The most recently created entity wins.
    #[default]
    LastCreatedWins,
    FirstCreatedWins,
}

impl FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "last" | "last-created" | "last_created" => Ok(Self::LastCreatedWins),
            "first" | "first-created" | "first_created" => Ok(Self::FirstCreatedWins),
            other => Err(format!("unknown collision policy `{other}`")),
        }
    }
}

/// Position of an entity inside an [`EntitySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Clean,
    Dirty,
    /// Not written yet; has no id.
    New,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    entity: TargetEntity<T>,
    state: SlotState,
}

/// Writes taken from a set, waiting for the store to acknowledge them.
#[derive(Debug, Default)]
pub struct PendingWrites {
    pub batch: WriteBatch,
    created: Vec<Handle>,
    updated: Vec<Handle>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len()
    }
}

pub struct EntitySet<T> {
    slots: Vec<Slot<T>>,
    by_external_id: HashMap<String, Handle>,
    natural: HashMap<KeyIndex, HashMap<String, Handle>>,
    norm: Normalizer,
    policy: CollisionPolicy,
    collisions: u64,
}

impl<T: Entity> EntitySet<T> {
    /// Scan every entity of `T::KIND` and index it.
    pub async fn build(
        store: &dyn TargetStore,
        norm: &Normalizer,
        policy: CollisionPolicy,
    ) -> Result<Self, StoreError> {
        let rows = store.scan(T::KIND).await?;
        let entities = rows
            .into_iter()
            .map(|row: StoredEntity| {
                let id = row.id;
                TargetEntity::from_stored(row).map_err(|err| {
                    StoreError::Corrupt(format!("{} {:?}: {err}", T::KIND, id))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let set = Self::from_entities(entities, norm, policy);
        debug!(
            kind = %T::KIND,
            entities = set.len(),
            external_ids = set.by_external_id.len(),
            collisions = set.collisions,
            "lookup index built"
        );
        Ok(set)
    }

    pub fn from_entities(
        mut entities: Vec<TargetEntity<T>>,
        norm: &Normalizer,
        policy: CollisionPolicy,
    ) -> Self {
        // Index in creation order so the policy sees a stable sequence.
        entities.sort_by_key(|e| (e.created_at, e.id));
        let mut set = Self {
            slots: Vec::with_capacity(entities.len()),
            by_external_id: HashMap::with_capacity(entities.len()),
            natural: HashMap::new(),
            norm: norm.clone(),
            policy,
            collisions: 0,
        };
        for entity in entities {
            set.slots.push(Slot {
                entity,
                state: SlotState::Clean,
            });
            set.index_slot(Handle(set.slots.len() - 1));
        }
        set
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.norm
    }

    pub fn get(&self, handle: Handle) -> &TargetEntity<T> {
        &self.slots[handle.0].entity
    }

    pub fn id_of(&self, handle: Handle) -> Option<EntityId> {
        self.slots[handle.0].entity.id
    }

    pub fn find_external(&self, external_id: &str) -> Option<Handle> {
        let key = self.norm.external_id(external_id)?;
        self.by_external_id.get(&key).copied()
    }

    /// First hit among `keys`, tried in order.
    pub fn find_natural(&self, keys: &[NaturalKey]) -> Option<Handle> {
        keys.iter().find_map(|k| {
            self.natural
                .get(&k.index)
                .and_then(|index| index.get(&k.key))
                .copied()
        })
    }

    /// Destination id of the entity carrying `external_id` in its marker.
    pub fn id_for_external(&self, external_id: &str) -> Option<EntityId> {
        self.find_external(external_id).and_then(|h| self.id_of(h))
    }

    pub fn insert(&mut self, entity: TargetEntity<T>) -> Handle {
        let state = if entity.id.is_some() {
            SlotState::Dirty
        } else {
            SlotState::New
        };
        self.slots.push(Slot { entity, state });
        let handle = Handle(self.slots.len() - 1);
        self.index_slot(handle);
        handle
    }

    /// Fold `body` and `import` into an indexed entity. Returns whether the
    /// entity changed; unchanged entities are not rewritten.
    pub fn absorb(&mut self, handle: Handle, body: T, import: &ImportMetadata) -> bool {
        let slot = &mut self.slots[handle.0];
        let before = slot.entity.clone();
        slot.entity.body.absorb(body, &self.norm);
        match slot.entity.import.as_mut() {
            Some(current) => current.absorb(import),
            None => slot.entity.import = Some(import.clone()),
        }
        self.finish_change(handle, before)
    }

    /// Attach or update only the import marker, leaving the body untouched.
    pub fn mark_imported(&mut self, handle: Handle, import: &ImportMetadata) -> bool {
        let slot = &mut self.slots[handle.0];
        let before = slot.entity.clone();
        match slot.entity.import.as_mut() {
            Some(current) => current.absorb(import),
            None => slot.entity.import = Some(import.clone()),
        }
        self.finish_change(handle, before)
    }

    fn finish_change(&mut self, handle: Handle, before: TargetEntity<T>) -> bool {
        let slot = &mut self.slots[handle.0];
        if slot.entity == before {
            return false;
        }
        if slot.state == SlotState::Clean {
            slot.state = if slot.entity.id.is_some() {
                SlotState::Dirty
            } else {
                SlotState::New
            };
        }
        self.index_slot(handle);
        true
    }

    pub fn pending_len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Clean)
            .count()
    }

    /// Take up to `max` pending writes (0 means all). The slots stay pending
    /// until [`acknowledge`](Self::acknowledge) is called.
    pub fn take_pending(&self, max: usize) -> Result<PendingWrites, StoreError> {
        let limit = if max == 0 { usize::MAX } else { max };
        let mut pending = PendingWrites::default();
        for (i, slot) in self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state != SlotState::Clean)
            .take(limit)
        {
            let stored = slot.entity.to_stored()?;
            match slot.state {
                SlotState::New => {
                    pending.batch.creates.push(stored);
                    pending.created.push(Handle(i));
                }
                SlotState::Dirty => {
                    pending.batch.updates.push(stored);
                    pending.updated.push(Handle(i));
                }
                SlotState::Clean => {}
            }
        }
        Ok(pending)
    }

    /// Mark a taken batch as written. `ids` are the ids the store assigned
    /// to the creates, in order.
    pub fn acknowledge(&mut self, pending: PendingWrites, ids: Vec<EntityId>) {
        let mut ids = ids.into_iter();
        for handle in pending.created {
            let slot = &mut self.slots[handle.0];
            if let Some(id) = ids.next() {
                slot.entity.id = Some(id);
            }
            slot.state = SlotState::Clean;
        }
        for handle in pending.updated {
            self.slots[handle.0].state = SlotState::Clean;
        }
    }

    /// Order used by the collision policy: creation time, then id, with
    /// unsaved entities after saved ones.
    fn age(&self, handle: Handle) -> (DateTime<Utc>, EntityId, usize) {
        let entity = &self.slots[handle.0].entity;
        (
            entity.created_at,
            entity.id.unwrap_or(EntityId::MAX),
            handle.0,
        )
    }

    fn index_slot(&mut self, handle: Handle) {
        let entity = &self.slots[handle.0].entity;
        let external: Vec<String> = entity
            .external_ids()
            .into_iter()
            .filter_map(|id| self.norm.external_id(id))
            .collect();
        let natural = entity.body.natural_keys(&self.norm);

        for key in external {
            if let Some(winner) = self.claim(None, &key, handle) {
                self.by_external_id.insert(key, winner);
            }
        }
        for NaturalKey { index, key } in natural {
            if let Some(winner) = self.claim(Some(index), &key, handle) {
                self.natural.entry(index).or_default().insert(key, winner);
            }
        }
    }

    /// Decide who holds `key` when `challenger` wants it. Returns the handle
    /// to store, or `None` when the current holder stays.
    fn claim(&mut self, index: Option<KeyIndex>, key: &str, challenger: Handle) -> Option<Handle> {
        let holder = match index {
            None => self.by_external_id.get(key),
            Some(index) => self.natural.get(&index).and_then(|m| m.get(key)),
        }
        .copied();
        let Some(holder) = holder else {
            return Some(challenger);
        };
        if holder == challenger {
            return None;
        }
        let challenger_newer = self.age(challenger) > self.age(holder);
        let winner = match (self.policy, challenger_newer) {
            (CollisionPolicy::LastCreatedWins, true) | (CollisionPolicy::FirstCreatedWins, false) => {
                challenger
            }
            _ => holder,
        };
        self.collisions += 1;
        let index_name = index.map_or("external_id", KeyIndex::as_str);
        warn!(
            kind = %T::KIND,
            index = index_name,
            key,
            previous = ?self.slots[holder.0].entity.id,
            winner = ?self.slots[winner.0].entity.id,
            "lookup key collision"
        );
        (winner != holder).then_some(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::import::CompanyImportMetadata;
    use crate::model::Company;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 9, 0, 0).unwrap()
    }

    fn company(id: EntityId, external_id: Option<&str>, name: &str, created: DateTime<Utc>) -> TargetEntity<Company> {
        TargetEntity {
            id: Some(id),
            created_at: created,
            body: Company {
                name: name.into(),
                phones: vec!["02 9000 0000".into()],
                ..Default::default()
            },
            import: external_id.map(|ext| {
                ImportMetadata::Company(CompanyImportMetadata {
                    external_id: ext.into(),
                    merged_external_ids: Vec::new(),
                    imported_at: created,
                })
            }),
        }
    }

    fn name_key(name: &str) -> Vec<NaturalKey> {
        vec![NaturalKey::new(KeyIndex::Name, name)]
    }

    #[test]
    fn most_recently_created_entity_wins_collisions() {
        let norm = Normalizer::default();
        // Scan order is not creation order.
        let set = EntitySet::from_entities(
            vec![
                company(2, Some("C2"), "Acme", at(5)),
                company(1, Some("C1"), "ACME ", at(1)),
            ],
            &norm,
            CollisionPolicy::LastCreatedWins,
        );
        let hit = set.find_natural(&name_key("acme")).unwrap();
        assert_eq!(set.id_of(hit), Some(2));
        // name and phone both collided
        assert_eq!(set.collisions(), 2);
        assert_eq!(set.id_for_external("c1"), Some(1));
    }

    #[test]
    fn first_created_policy_keeps_the_older_entity() {
        let norm = Normalizer::default();
        let set = EntitySet::from_entities(
            vec![company(2, None, "Acme", at(5)), company(1, None, "Acme", at(1))],
            &norm,
            CollisionPolicy::FirstCreatedWins,
        );
        let hit = set.find_natural(&name_key("acme")).unwrap();
        assert_eq!(set.id_of(hit), Some(1));
    }

    #[test]
    fn external_ids_are_matched_after_normalization() {
        let norm = Normalizer::default();
        let set = EntitySet::from_entities(
            vec![company(7, Some("00123"), "Acme", at(1))],
            &norm,
            CollisionPolicy::default(),
        );
        assert_eq!(set.id_for_external(" 00123 "), Some(7));
        assert_eq!(set.id_for_external("123"), None);
        assert!(set.find_external("").is_none());
    }

    #[test]
    fn only_changed_entities_are_pending() {
        let norm = Normalizer::default();
        let mut set = EntitySet::from_entities(
            vec![company(1, Some("C1"), "Acme", at(1))],
            &norm,
            CollisionPolicy::default(),
        );
        let h = set.find_external("C1").unwrap();
        let same = set.get(h).clone();
        let import = same.import.clone().unwrap();
        assert!(!set.absorb(h, same.body, &import));
        assert_eq!(set.pending_len(), 0);

        let changed = Company {
            name: "Acme".into(),
            abn: Some("12 345".into()),
            ..Default::default()
        };
        assert!(set.absorb(h, changed, &import));
        let pending = set.take_pending(0).unwrap();
        assert_eq!(pending.batch.updates.len(), 1);
        assert!(pending.batch.creates.is_empty());
        set.acknowledge(pending, Vec::new());
        assert_eq!(set.pending_len(), 0);
    }

    #[test]
    fn acknowledged_creates_receive_ids_and_stay_indexed() {
        let norm = Normalizer::default();
        let mut set: EntitySet<Company> = EntitySet::from_entities(Vec::new(), &norm, CollisionPolicy::default());
        let mut fresh = company(0, Some("C9"), "Beta", at(2));
        fresh.id = None;
        let h = set.insert(fresh);
        assert_eq!(set.id_for_external("C9"), None);

        let pending = set.take_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        set.acknowledge(pending, vec![41]);
        assert_eq!(set.id_of(h), Some(41));
        assert_eq!(set.id_for_external("c9"), Some(41));
        assert!(set.take_pending(0).unwrap().is_empty());
    }
}
