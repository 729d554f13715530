//! Relationship linker: upsert links between resolved entities and pick the
//! primary link per subject.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{EntityId, LinkAttrs, LinkKind, LinkStatus, RelationshipLink};
use crate::outcome::RecordOutcome;
use crate::store::{LinkBatch, TargetStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Clean,
    Dirty,
    New,
}

#[derive(Debug, Clone)]
struct LinkSlot {
    link: RelationshipLink,
    state: LinkState,
}

/// Every link of one kind, indexed by endpoint pair and by the legacy row
/// that produced it.
pub struct LinkSet {
    kind: LinkKind,
    slots: Vec<LinkSlot>,
    by_pair: HashMap<(EntityId, EntityId), usize>,
    by_external_id: HashMap<String, usize>,
    touched: BTreeSet<EntityId>,
}

impl LinkSet {
    pub async fn build(store: &dyn TargetStore, kind: LinkKind) -> Result<Self, StoreError> {
        let links = store.scan_links(kind).await?;
        let set = Self::from_links(kind, links);
        debug!(kind = %kind, links = set.len(), "link index built");
        Ok(set)
    }

    pub fn from_links(kind: LinkKind, mut links: Vec<RelationshipLink>) -> Self {
        links.retain(|l| l.kind == kind);
        links.sort_by_key(|l| (l.created_at, l.id));
        let mut set = Self {
            kind,
            slots: Vec::with_capacity(links.len()),
            by_pair: HashMap::with_capacity(links.len()),
            by_external_id: HashMap::new(),
            touched: BTreeSet::new(),
        };
        for link in links {
            set.slots.push(LinkSlot {
                link,
                state: LinkState::Clean,
            });
            set.index(set.slots.len() - 1);
        }
        set
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, subject: EntityId, object: EntityId) -> Option<&RelationshipLink> {
        self.by_pair
            .get(&(subject, object))
            .map(|&i| &self.slots[i].link)
    }

    /// Links of one subject, in creation order.
    pub fn for_subject(&self, subject: EntityId) -> Vec<&RelationshipLink> {
        self.slots
            .iter()
            .map(|s| &s.link)
            .filter(|l| l.subject_id == subject)
            .collect()
    }

    fn index(&mut self, i: usize) {
        let link = &self.slots[i].link;
        self.by_pair.insert((link.subject_id, link.object_id), i);
        if let Some(ext) = &link.external_id {
            self.by_external_id.insert(ext.clone(), i);
        }
    }

    /// Existing link this call should update, if any, and a link whose
    /// marker must be cleared. A link found by its external id is re-pointed
    /// only when the new pair is not already taken by a different link; in
    /// that case the paired link takes over the marker.
    fn existing(
        &self,
        subject: EntityId,
        object: EntityId,
        external_id: Option<&str>,
    ) -> (Option<usize>, Option<usize>) {
        let by_pair = self.by_pair.get(&(subject, object)).copied();
        let by_marker = external_id.and_then(|ext| self.by_external_id.get(ext).copied());
        match (by_marker, by_pair) {
            (Some(marked), Some(paired)) if marked != paired => (Some(paired), Some(marked)),
            (Some(marked), _) => (Some(marked), None),
            (None, paired) => (paired, None),
        }
    }

    /// Create the link or update the existing one in place. `is_primary` is
    /// left to [`designate_primaries`](Self::designate_primaries). A marker
    /// lives on one link only: when the row's pair already exists elsewhere,
    /// the link that held the marker keeps its pair and loses the marker.
    pub fn link(
        &mut self,
        subject: EntityId,
        object: EntityId,
        attrs: LinkAttrs,
        now: DateTime<Utc>,
    ) -> RecordOutcome {
        self.touched.insert(subject);
        let (target, stale) = self.existing(subject, object, attrs.external_id.as_deref());
        if let Some(j) = stale {
            let before = self.slots[j].link.clone();
            self.slots[j].link.external_id = None;
            self.mark_changed(j, &before);
        }
        let Some(i) = target else {
            self.slots.push(LinkSlot {
                link: RelationshipLink {
                    id: None,
                    kind: self.kind,
                    subject_id: subject,
                    object_id: object,
                    status: attrs.status,
                    relationship_date: attrs.relationship_date,
                    is_primary: false,
                    reason: attrs.reason,
                    external_id: attrs.external_id,
                    created_at: now,
                },
                state: LinkState::New,
            });
            self.index(self.slots.len() - 1);
            return RecordOutcome::Created;
        };

        let slot = &mut self.slots[i];
        let before = slot.link.clone();
        if (slot.link.subject_id, slot.link.object_id) != (subject, object) {
            self.touched.insert(slot.link.subject_id);
            self.by_pair.remove(&(slot.link.subject_id, slot.link.object_id));
            slot.link.subject_id = subject;
            slot.link.object_id = object;
        }
        slot.link.status = attrs.status;
        if attrs.relationship_date.is_some() {
            slot.link.relationship_date = attrs.relationship_date;
        }
        if attrs.reason.is_some() {
            slot.link.reason = attrs.reason;
        }
        if attrs.external_id.is_some() {
            slot.link.external_id = attrs.external_id;
        }
        self.mark_changed(i, &before);
        self.index(i);
        RecordOutcome::Updated
    }

    fn mark_changed(&mut self, i: usize, before: &RelationshipLink) {
        let slot = &mut self.slots[i];
        if slot.link != *before && slot.state == LinkState::Clean {
            slot.state = if slot.link.id.is_some() {
                LinkState::Dirty
            } else {
                LinkState::New
            };
        }
    }

    /// Post-pass over every subject linked in this phase: among its ACTIVE
    /// links the one with the latest relationship date (ties: latest
    /// creation) becomes primary, every other link of the subject is not.
    /// Returns the number of links whose flag changed.
    pub fn designate_primaries(&mut self) -> usize {
        let touched = std::mem::take(&mut self.touched);
        let siblings: HashMap<EntityId, Vec<usize>> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| touched.contains(&slot.link.subject_id))
            .map(|(i, slot)| (slot.link.subject_id, i))
            .into_group_map();

        let mut changed = 0;
        for indices in siblings.values() {
            let primary = indices
                .iter()
                .copied()
                .filter(|&i| self.slots[i].link.status == LinkStatus::Active)
                .max_by_key(|&i| {
                    let link = &self.slots[i].link;
                    (link.relationship_date, link.created_at, i)
                });
            for &i in indices {
                let want = Some(i) == primary;
                if self.slots[i].link.is_primary != want {
                    let before = self.slots[i].link.clone();
                    self.slots[i].link.is_primary = want;
                    self.mark_changed(i, &before);
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn pending_len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != LinkState::Clean)
            .count()
    }

    pub fn take_pending(&self) -> LinkBatch {
        let mut batch = LinkBatch::default();
        for slot in &self.slots {
            match slot.state {
                LinkState::New => batch.creates.push(slot.link.clone()),
                LinkState::Dirty => batch.updates.push(slot.link.clone()),
                LinkState::Clean => {}
            }
        }
        batch
    }

    /// Forget pending state once the batch is written, or after a dry run.
    pub fn acknowledge(&mut self) {
        for slot in &mut self.slots {
            slot.state = LinkState::Clean;
        }
    }
}
