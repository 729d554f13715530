use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info, instrument};

use super::{LinkBatch, TargetStore, WriteBatch};
use crate::error::StoreError;
use crate::model::{
    EntityId, EntityKind, ImportMetadata, LinkKind, LinkStatus, RelationshipLink, StoredEntity,
};
use crate::util::env::env_parse;

const SCHEMA: &str = include_str!("../../migrations/0001_initial.sql");

/// Rows per multi-row link INSERT; keeps bind counts well under SQLite limits.
const LINK_INSERT_CHUNK: usize = 500;

/// Appended to a link's kind while an update batch is in flight.
const PARKED_SUFFIX: &str = ":parked";

/// SQLite-backed destination store.
#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let busy_secs: u64 = env_parse("SQLITE_BUSY_TIMEOUT_SECS", 30);
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(busy_secs))
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(10));
        let pool_options = if in_memory {
            // Each connection to :memory: is its own database; pin a single one.
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(env_parse("DB_MAX_CONNS", 4u32))
                .idle_timeout(Duration::from_secs(600))
        };
        let pool = pool_options.connect_with(options).await?;
        info!(in_memory, "connected to destination store");

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Schema statements are all `IF NOT EXISTS`, so this is safe on every connect.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(pool).await?;
        debug!("destination schema ensured");
        Ok(())
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp `{raw}`: {e}")))
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn parse_date(raw: Option<String>) -> Result<Option<NaiveDate>, StoreError> {
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|e| StoreError::Corrupt(format!("bad date `{s}`: {e}")))
    })
    .transpose()
}

fn import_json(import: &Option<ImportMetadata>) -> Result<Option<String>, StoreError> {
    Ok(import.as_ref().map(serde_json::to_string).transpose()?)
}

fn entity_from_row(row: &SqliteRow) -> Result<StoredEntity, StoreError> {
    let id: i64 = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let kind = EntityKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("entity {id} has unknown kind `{kind}`")))?;
    let created_at: String = row.try_get("created_at")?;
    let body: String = row.try_get("body")?;
    let import: Option<String> = row.try_get("import_meta")?;
    Ok(StoredEntity {
        id: Some(id),
        kind,
        created_at: parse_ts(&created_at)?,
        body: serde_json::from_str(&body)?,
        import: import.map(|s| serde_json::from_str(&s)).transpose()?,
    })
}

fn link_from_row(row: &SqliteRow) -> Result<RelationshipLink, StoreError> {
    let id: i64 = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(RelationshipLink {
        id: Some(id),
        kind: LinkKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("link {id} has unknown kind `{kind}`")))?,
        subject_id: row.try_get("subject_id")?,
        object_id: row.try_get("object_id")?,
        status: LinkStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("link {id} has unknown status `{status}`")))?,
        relationship_date: parse_date(row.try_get("relationship_date")?)?,
        is_primary: row.try_get("is_primary")?,
        reason: row.try_get("reason")?,
        external_id: row.try_get("external_id")?,
        created_at: parse_ts(&created_at)?,
    })
}

async fn bulk_create(
    conn: &mut SqliteConnection,
    creates: &[StoredEntity],
    now: &str,
) -> Result<Vec<EntityId>, StoreError> {
    let mut ids = Vec::with_capacity(creates.len());
    for entity in creates {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO entities (kind, created_at, updated_at, body, import_meta) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(entity.kind.as_str())
        .bind(format_ts(entity.created_at))
        .bind(now)
        .bind(serde_json::to_string(&entity.body)?)
        .bind(import_json(&entity.import)?)
        .fetch_one(&mut *conn)
        .await?;
        ids.push(id);
    }
    Ok(ids)
}

async fn bulk_update(
    conn: &mut SqliteConnection,
    updates: &[StoredEntity],
    now: &str,
) -> Result<(), StoreError> {
    for entity in updates {
        let id = entity
            .id
            .ok_or_else(|| StoreError::Corrupt(format!("update of unsaved {}", entity.kind)))?;
        let result = sqlx::query(
            "UPDATE entities SET body = ?, import_meta = ?, updated_at = ? WHERE id = ? AND kind = ?",
        )
        .bind(serde_json::to_string(&entity.body)?)
        .bind(import_json(&entity.import)?)
        .bind(now)
        .bind(id)
        .bind(entity.kind.as_str())
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("{} {id} does not exist", entity.kind)));
        }
    }
    Ok(())
}

#[async_trait]
impl TargetStore for Db {
    async fn scan(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, created_at, body, import_meta FROM entities WHERE kind = ? ORDER BY id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn count_migrated(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entities WHERE kind = ? AND import_meta IS NOT NULL",
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(n.max(0) as u64)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<Vec<EntityId>, StoreError> {
        let now = format_ts(Utc::now());
        let mut tx = self.pool.begin().await?;
        let ids = bulk_create(&mut tx, &batch.creates, &now).await?;
        bulk_update(&mut tx, &batch.updates, &now).await?;
        tx.commit().await?;
        debug!(
            created = ids.len(),
            updated = batch.updates.len(),
            "entity batch committed"
        );
        Ok(ids)
    }

    async fn scan_links(&self, kind: LinkKind) -> Result<Vec<RelationshipLink>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, subject_id, object_id, status, relationship_date, is_primary, \
                    reason, external_id, created_at \
             FROM relationship_links WHERE kind = ? ORDER BY id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(link_from_row).collect()
    }

    async fn count_links(&self, kind: LinkKind) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relationship_links WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn apply_links(&self, batch: LinkBatch) -> Result<(), StoreError> {
        let now = format_ts(Utc::now());
        let mut tx = self.pool.begin().await?;
        // Updates run first and free their old pairs before any insert. Rows
        // are parked under a side kind so pairs swapped inside one batch never
        // meet the unique index half-applied.
        for link in &batch.updates {
            let id = link
                .id
                .ok_or_else(|| StoreError::Corrupt(format!("update of unsaved {} link", link.kind)))?;
            let result = sqlx::query("UPDATE relationship_links SET kind = ? WHERE id = ? AND kind = ?")
                .bind(format!("{}{PARKED_SUFFIX}", link.kind.as_str()))
                .bind(id)
                .bind(link.kind.as_str())
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Corrupt(format!("{} link {id} does not exist", link.kind)));
            }
        }
        for link in &batch.updates {
            sqlx::query(
                "UPDATE relationship_links SET kind = ?, subject_id = ?, object_id = ?, status = ?, \
                 relationship_date = ?, is_primary = ?, reason = ?, external_id = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(link.kind.as_str())
            .bind(link.subject_id)
            .bind(link.object_id)
            .bind(link.status.as_str())
            .bind(format_date(link.relationship_date))
            .bind(link.is_primary)
            .bind(link.reason.clone())
            .bind(link.external_id.clone())
            .bind(&now)
            .bind(link.id)
            .execute(&mut *tx)
            .await?;
        }
        for chunk in batch.creates.chunks(LINK_INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO relationship_links (kind, subject_id, object_id, status, \
                 relationship_date, is_primary, reason, external_id, created_at, updated_at) ",
            );
            qb.push_values(chunk, |mut b, link| {
                b.push_bind(link.kind.as_str())
                    .push_bind(link.subject_id)
                    .push_bind(link.object_id)
                    .push_bind(link.status.as_str())
                    .push_bind(format_date(link.relationship_date))
                    .push_bind(link.is_primary)
                    .push_bind(link.reason.clone())
                    .push_bind(link.external_id.clone())
                    .push_bind(format_ts(link.created_at))
                    .push_bind(now.clone());
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(
            created = batch.creates.len(),
            updated = batch.updates.len(),
            "link batch committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::import::CompanyImportMetadata;

    fn company(name: &str, with_marker: bool) -> StoredEntity {
        StoredEntity {
            id: None,
            kind: EntityKind::Company,
            created_at: Utc::now(),
            body: serde_json::json!({ "name": name }),
            import: with_marker.then(|| {
                ImportMetadata::Company(CompanyImportMetadata {
                    external_id: name.to_lowercase(),
                    merged_external_ids: Vec::new(),
                    imported_at: Utc::now(),
                })
            }),
        }
    }

    #[tokio::test]
    async fn entities_round_trip_through_sqlite() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let ids = db
            .apply(WriteBatch {
                creates: vec![company("Acme", true), company("Legacy Co", false)],
                updates: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let mut scanned = db.scan(EntityKind::Company).await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(db.count_migrated(EntityKind::Company).await.unwrap(), 1);

        scanned[0].body = serde_json::json!({ "name": "Acme Pty Ltd" });
        db.apply(WriteBatch {
            creates: Vec::new(),
            updates: vec![scanned[0].clone()],
        })
        .await
        .unwrap();
        let rescanned = db.scan(EntityKind::Company).await.unwrap();
        assert_eq!(rescanned[0].body["name"], "Acme Pty Ltd");
        assert_eq!(rescanned[0].import, scanned[0].import);
    }

    #[tokio::test]
    async fn link_pairs_are_unique() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let ids = db
            .apply(WriteBatch {
                creates: vec![company("A", true), company("B", true)],
                updates: Vec::new(),
            })
            .await
            .unwrap();
        let link = RelationshipLink {
            id: None,
            kind: LinkKind::ReferrerCompany,
            subject_id: ids[0],
            object_id: ids[1],
            status: LinkStatus::Active,
            relationship_date: NaiveDate::from_ymd_opt(2024, 6, 1),
            is_primary: true,
            reason: Some("initial".into()),
            external_id: None,
            created_at: Utc::now(),
        };
        db.apply_links(LinkBatch {
            creates: vec![link.clone()],
            updates: Vec::new(),
        })
        .await
        .unwrap();
        let duplicate = db
            .apply_links(LinkBatch {
                creates: vec![link],
                updates: Vec::new(),
            })
            .await;
        assert!(duplicate.is_err());

        let links = db.scan_links(LinkKind::ReferrerCompany).await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].is_primary);
        assert_eq!(links[0].relationship_date, NaiveDate::from_ymd_opt(2024, 6, 1));
    }

    fn referral(subject: EntityId, object: EntityId, external_id: &str) -> RelationshipLink {
        RelationshipLink {
            id: None,
            kind: LinkKind::PatientReferrer,
            subject_id: subject,
            object_id: object,
            status: LinkStatus::Active,
            relationship_date: None,
            is_primary: true,
            reason: None,
            external_id: Some(external_id.into()),
            created_at: Utc::now(),
        }
    }

    async fn three_companies(db: &Db) -> Vec<EntityId> {
        db.apply(WriteBatch {
            creates: vec![company("A", true), company("B", true), company("C", true)],
            updates: Vec::new(),
        })
        .await
        .unwrap()
    }

    fn pairs(links: &[RelationshipLink]) -> Vec<(Option<String>, EntityId, EntityId)> {
        let mut pairs: Vec<_> = links
            .iter()
            .map(|l| (l.external_id.clone(), l.subject_id, l.object_id))
            .collect();
        pairs.sort();
        pairs
    }

    #[tokio::test]
    async fn relinked_rows_move_subject_and_free_their_pair() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let ids = three_companies(&db).await;
        let (p1, p2, r) = (ids[0], ids[1], ids[2]);
        db.apply_links(LinkBatch {
            creates: vec![referral(p1, r, "500")],
            updates: Vec::new(),
        })
        .await
        .unwrap();

        // Row 500 now names the second subject; row 502 takes the old pair.
        let mut moved = db.scan_links(LinkKind::PatientReferrer).await.unwrap().remove(0);
        moved.subject_id = p2;
        db.apply_links(LinkBatch {
            creates: vec![referral(p1, r, "502")],
            updates: vec![moved],
        })
        .await
        .unwrap();

        let links = db.scan_links(LinkKind::PatientReferrer).await.unwrap();
        assert_eq!(
            pairs(&links),
            vec![(Some("500".into()), p2, r), (Some("502".into()), p1, r)]
        );
    }

    #[tokio::test]
    async fn pairs_swapped_in_one_batch_are_accepted() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let ids = three_companies(&db).await;
        let (p1, p2, r) = (ids[0], ids[1], ids[2]);
        db.apply_links(LinkBatch {
            creates: vec![referral(p1, r, "a"), referral(p2, r, "b")],
            updates: Vec::new(),
        })
        .await
        .unwrap();

        let mut links = db.scan_links(LinkKind::PatientReferrer).await.unwrap();
        links[0].subject_id = p2;
        links[1].subject_id = p1;
        db.apply_links(LinkBatch {
            creates: Vec::new(),
            updates: links,
        })
        .await
        .unwrap();

        let links = db.scan_links(LinkKind::PatientReferrer).await.unwrap();
        assert_eq!(
            pairs(&links),
            vec![(Some("a".into()), p2, r), (Some("b".into()), p1, r)]
        );
    }
}
