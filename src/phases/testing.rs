//! Test harness: a temporary CSV export, an in-memory destination and a
//! checkpoint file, wired into a [`MigrationContext`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::checkpoint::CheckpointTracker;
use crate::config::MigrationConfig;
use crate::error::StoreError;
use crate::model::{EntityId, EntityKind, LinkKind, RelationshipLink, StoredEntity};
use crate::runner::{MigrationContext, PhaseRunner, PhaseSummary};
use crate::source::SourceSet;
use crate::store::{LinkBatch, MemoryStore, SharedStore, TargetStore, WriteBatch};

/// A small export touching every sheet. `letter.pdf` must be seeded as an
/// existing document for the relink phase to resolve it.
pub(crate) const EXPORT: &[(&str, &str)] = &[
    ("Companies.csv", "id_Company,Name\n1,Harbour Medical\n"),
    ("Referrers.csv", "id_Referrer,id_Company,First Name,Last Name\n10,1,Priya,Nair\n11,7,Tom,Baker\n"),
    (
        "Patients.csv",
        "id_Contact,First Name,Last Name,Coordinator First Name,Coordinator Last Name\n\
         1,Ann,Lee,Jane,Smith\n\
         2,Bob,Ng,,\n\
         3,,,,\n",
    ),
    (
        "Communications.csv",
        "id,id_Contact,Type,Date,Notes\n100,1,Phone,2024-01-02,Called\n101,2,Email,2024-01-03,Sent\n102,9,Phone,2024-01-04,Lost\n",
    ),
    (
        "Referrals.csv",
        "id,id_Contact,id_Referrer,Referral Date\n500,1,10,2024-01-01\n501,2,11,2024-02-01\n502,1,11,2024-03-01\n",
    ),
    ("Documents.csv", "id,id_Contact,File Name\n900,1,letter.pdf\n901,2,missing.pdf\n"),
    ("Images.csv", "id,id_Contact,File Name\n"),
];

pub(crate) struct Harness {
    pub dir: PathBuf,
    pub store: Arc<MemoryStore>,
    pub config: MigrationConfig,
}

impl Harness {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let dir = std::env::temp_dir().join(format!("practice-migrate-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = MigrationConfig {
            source: dir.clone(),
            checkpoint: dir.join("checkpoint.json"),
            db_url: "memory".into(),
            ..MigrationConfig::default()
        };
        let harness = Self {
            dir,
            store: Arc::new(MemoryStore::new()),
            config,
        };
        for (name, contents) in files {
            harness.write(name, contents);
        }
        harness
    }

    pub fn write(&self, name: &str, contents: &str) {
        std::fs::write(self.dir.join(name), contents).unwrap();
    }

    pub fn context_with(&self, config: MigrationConfig, store: SharedStore) -> MigrationContext {
        let tracker = if config.dry_run {
            CheckpointTracker::detached(&config.checkpoint, config.max_recorded_errors).unwrap()
        } else {
            CheckpointTracker::load_or_new(&config.checkpoint, config.max_recorded_errors).unwrap()
        };
        let sources = SourceSet::from_config(&config).unwrap();
        MigrationContext::new(config, store, sources, tracker)
    }

    pub fn context(&self) -> MigrationContext {
        self.context_with(self.config.clone(), self.store.clone())
    }

    pub async fn run_phase(&self, name: &str) -> anyhow::Result<PhaseSummary> {
        let mut ctx = self.context();
        PhaseRunner::standard().run_phase(&mut ctx, name).await
    }

    pub async fn run_phases(&self, names: &[&str]) -> anyhow::Result<Vec<PhaseSummary>> {
        let mut ctx = self.context();
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        PhaseRunner::standard().run_selected(&mut ctx, &names).await
    }

    pub async fn entities(&self, kind: EntityKind) -> Vec<StoredEntity> {
        self.store.scan(kind).await.unwrap()
    }

    pub async fn links(&self, kind: LinkKind) -> Vec<RelationshipLink> {
        self.store.scan_links(kind).await.unwrap()
    }

    /// Seed a pre-existing entity the way another system would have.
    pub async fn seed(&self, kind: EntityKind, body: serde_json::Value) -> EntityId {
        self.store
            .insert(StoredEntity {
                id: None,
                kind,
                created_at: chrono::Utc::now(),
                body,
                import: None,
            })
            .await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// End state with timestamps stripped, for comparing separate runs.
pub(crate) async fn canonical_state(store: &MemoryStore) -> (Vec<String>, Vec<String>) {
    let (entities, links) = store.snapshot().await;
    let mut entities: Vec<String> = entities
        .into_iter()
        .map(|e| {
            let ids = e
                .import
                .as_ref()
                .map(|m| m.external_ids().join(","))
                .unwrap_or_default();
            format!("{:?} {:?} {} [{}]", e.id, e.kind, e.body, ids)
        })
        .collect();
    entities.sort();
    let mut links: Vec<String> = links
        .into_iter()
        .map(|l| {
            format!(
                "{} {}->{} {:?} primary={} {:?} {:?}",
                l.kind, l.subject_id, l.object_id, l.status, l.is_primary, l.relationship_date, l.external_id
            )
        })
        .collect();
    links.sort();
    (entities, links)
}

/// Store whose entity writes start failing after `succeed` batches, like a
/// process killed mid-phase.
pub(crate) struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    succeed: usize,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, succeed: usize) -> Self {
        Self {
            inner,
            succeed,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TargetStore for FlakyStore {
    async fn scan(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError> {
        self.inner.scan(kind).await
    }

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        self.inner.count(kind).await
    }

    async fn count_migrated(&self, kind: EntityKind) -> Result<u64, StoreError> {
        self.inner.count_migrated(kind).await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<Vec<EntityId>, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.succeed {
            return Err(StoreError::Corrupt("connection reset".into()));
        }
        self.inner.apply(batch).await
    }

    async fn scan_links(&self, kind: LinkKind) -> Result<Vec<RelationshipLink>, StoreError> {
        self.inner.scan_links(kind).await
    }

    async fn count_links(&self, kind: LinkKind) -> Result<u64, StoreError> {
        self.inner.count_links(kind).await
    }

    async fn apply_links(&self, batch: LinkBatch) -> Result<(), StoreError> {
        self.inner.apply_links(batch).await
    }
}
