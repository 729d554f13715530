//! Create / update / merge decision for one source record.

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::error::RecordError;
use crate::index::{EntitySet, Handle};
use crate::model::{Entity, EntityId, ImportMetadata, TargetEntity};
use crate::outcome::RecordOutcome;

/// What the resolver did with a record and which entity it landed on.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub outcome: RecordOutcome,
    pub handle: Handle,
}

/// Resolve one transformed record against `set`.
///
/// 1. external id found in a marker: update in place;
/// 2. a natural key matches: merge into that entity, remembering the
///    external id;
/// 3. otherwise create a new entity carrying the marker.
///
/// Nothing is written here; changed entities stay pending in `set`.
pub fn upsert<T: Entity>(
    set: &mut EntitySet<T>,
    external_id: &str,
    body: T,
    import: ImportMetadata,
    now: DateTime<Utc>,
) -> Resolution {
    if let Some(handle) = set.find_external(external_id) {
        let changed = set.absorb(handle, body, &import);
        trace!(kind = %T::KIND, external_id, changed, "resolved by external id");
        return Resolution {
            outcome: RecordOutcome::Updated,
            handle,
        };
    }

    let keys = body.natural_keys(set.normalizer());
    if let Some(handle) = set.find_natural(&keys) {
        let changed = set.absorb(handle, body, &import);
        trace!(kind = %T::KIND, external_id, changed, "merged by natural key");
        return Resolution {
            outcome: RecordOutcome::Merged,
            handle,
        };
    }

    let handle = set.insert(TargetEntity::new(body, import, now));
    trace!(kind = %T::KIND, external_id, "new entity");
    Resolution {
        outcome: RecordOutcome::Created,
        handle,
    }
}

/// Destination id for a foreign-key cell. Entities created earlier in the
/// same uncommitted phase have no id yet and do not resolve.
pub fn reference<T: Entity>(
    set: &EntitySet<T>,
    field: &'static str,
    external_id: Option<&str>,
) -> Result<EntityId, RecordError> {
    let external_id = external_id.ok_or(RecordError::MissingField(field))?;
    set.id_for_external(external_id)
        .ok_or_else(|| RecordError::unresolved(field, external_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CollisionPolicy;
    use crate::model::import::CoordinatorImportMetadata;
    use crate::model::Coordinator;
    use crate::normalization::Normalizer;
    use crate::outcome::SkipReason;

    fn jane(phone: &str) -> Coordinator {
        Coordinator {
            first_name: Some("Jane".into()),
            last_name: Some("Smith".into()),
            phones: vec![phone.into()],
            ..Default::default()
        }
    }

    fn marker(external_id: &str) -> ImportMetadata {
        ImportMetadata::Coordinator(CoordinatorImportMetadata {
            external_id: external_id.into(),
            merged_external_ids: Vec::new(),
            imported_at: Utc::now(),
        })
    }

    fn empty_set() -> EntitySet<Coordinator> {
        EntitySet::from_entities(Vec::new(), &Normalizer::default(), CollisionPolicy::default())
    }

    fn phones_after(order: &[(&str, &str)]) -> Vec<String> {
        let mut set = empty_set();
        let mut last = None;
        for (ext, phone) in order {
            last = Some(upsert(&mut set, ext, jane(phone), marker(ext), Utc::now()).handle);
        }
        let mut phones = set.get(last.unwrap()).body.phones.clone();
        phones.sort();
        phones
    }

    #[test]
    fn create_then_merge_then_update() {
        let mut set = empty_set();
        let first = upsert(&mut set, "R1", jane("0412 345 678"), marker("R1"), Utc::now());
        assert_eq!(first.outcome, RecordOutcome::Created);

        let second = upsert(&mut set, "R2", jane("0298 765 432"), marker("R2"), Utc::now());
        assert_eq!(second.outcome, RecordOutcome::Merged);
        assert_eq!(second.handle, first.handle);

        // R2 is now a known external id of the same coordinator.
        let again = upsert(&mut set, "R2", jane("0298 765 432"), marker("R2"), Utc::now());
        assert_eq!(again.outcome, RecordOutcome::Updated);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(first.handle).external_ids(), vec!["R1", "R2"]);
    }

    #[test]
    fn merge_order_does_not_change_the_phone_set() {
        let forward = phones_after(&[("R1", "0412 345 678"), ("R2", "0298 765 432")]);
        let backward = phones_after(&[("R2", "0298 765 432"), ("R1", "0412 345 678")]);
        assert_eq!(forward, backward);
        assert_eq!(forward, vec!["0298 765 432", "0412 345 678"]);
    }

    #[test]
    fn same_phone_in_another_format_is_not_duplicated() {
        let phones = phones_after(&[("R1", "0412 345 678"), ("R2", "+61412345678")]);
        assert_eq!(phones, vec!["0412 345 678"]);
    }

    #[test]
    fn references_need_a_saved_entity() {
        let mut set = empty_set();
        upsert(&mut set, "R1", jane("0412 345 678"), marker("R1"), Utc::now());
        assert_eq!(
            reference(&set, "coordinator", Some("R1")),
            Err(RecordError::unresolved("coordinator", "R1"))
        );
        assert_eq!(
            reference(&set, "coordinator", None).map_err(RecordError::into_outcome),
            Err(RecordOutcome::Skipped(SkipReason::MissingField("coordinator")))
        );

        let pending = set.take_pending(0).unwrap();
        set.acknowledge(pending, vec![5]);
        assert_eq!(reference(&set, "coordinator", Some("r1")), Ok(5));
    }
}
