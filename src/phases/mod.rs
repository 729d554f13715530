//! The migration phases, in dependency order, and the row transforms they
//! share.

pub mod attachments;
pub mod communications;
pub mod companies;
pub mod coordinators;
pub mod links;
pub mod patients;
pub mod referrers;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use chrono::Utc;
use tracing::warn;

use crate::error::RecordError;
use crate::index::EntitySet;
use crate::model::{Address, Entity, ImportMetadata};
use crate::normalization::codes::parse_active_flag;
use crate::normalization::text::{join_notes, normalize_email};
use crate::normalization::Normalizer;
use crate::resolve::upsert;
use crate::runner::{MigrationContext, Phase};
use crate::source::sheets::address;
use crate::source::{SheetSpec, SourceRecord};

pub use attachments::{RelinkDocuments, RelinkImages};
pub use communications::ImportCommunications;
pub use companies::ImportCompanies;
pub use coordinators::ImportCoordinators;
pub use links::{LinkPatientCoordinators, LinkPatientReferrers, LinkReferrerCompanies};
pub use patients::ImportPatients;
pub use referrers::ImportReferrers;

pub fn all() -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(ImportCompanies),
        Box::new(ImportReferrers),
        Box::new(ImportCoordinators),
        Box::new(ImportPatients),
        Box::new(ImportCommunications),
        Box::new(LinkReferrerCompanies),
        Box::new(LinkPatientReferrers),
        Box::new(LinkPatientCoordinators),
        Box::new(RelinkDocuments),
        Box::new(RelinkImages),
    ]
}

/// Extract, transform and upsert every row of `sheet` into a fresh index of
/// `T`, then commit. Transform failures become record outcomes.
pub(crate) async fn import_sheet<T, F>(
    ctx: &mut MigrationContext,
    sheet: &'static SheetSpec,
    transform: F,
) -> Result<EntitySet<T>>
where
    T: Entity,
    F: Fn(&SourceRecord, &Normalizer) -> Result<(T, ImportMetadata), RecordError> + Send + Sync,
{
    let mut set = ctx.load::<T>().await?;
    let mut feed = ctx.open(sheet).await?;
    while let Some(record) = feed.next(ctx).await? {
        let outcome = match transform(&record, ctx.norm()) {
            Ok((body, import)) => upsert(&mut set, &record.external_id, body, import, Utc::now()).outcome,
            Err(err) => err.into_outcome(),
        };
        ctx.record(&record, outcome)?;
        ctx.commit_if_full(&mut set).await?;
    }
    ctx.commit(&mut set).await?;
    Ok(set)
}

/// Non-blank phone cells, as written.
pub(crate) fn phones(record: &SourceRecord, columns: &[&str]) -> Vec<String> {
    columns
        .iter()
        .filter_map(|c| record.get_string(c))
        .collect()
}

/// Emails from a cell that may hold several separated by `;` or `,`.
/// Entries without an `@` are dropped.
pub(crate) fn emails(record: &SourceRecord, column: &str) -> Vec<String> {
    let Some(raw) = record.get(column) else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for part in raw.split([';', ',']).map(str::trim).filter(|p| !p.is_empty()) {
        match normalize_email(part) {
            Some(email) if !out.contains(&email) => out.push(email),
            Some(_) => {}
            None => warn!(
                sheet = record.sheet,
                external_id = %record.external_id,
                value = part,
                "dropping invalid email"
            ),
        }
    }
    out
}

pub(crate) fn notes(record: &SourceRecord, columns: &[&str]) -> Option<String> {
    join_notes(columns.iter().filter_map(|c| record.get(c)))
}

pub(crate) fn address_of(record: &SourceRecord) -> Option<Address> {
    Address {
        line1: record.get_string(address::LINE1),
        line2: record.get_string(address::LINE2),
        suburb: record.get_string(address::SUBURB),
        state: record.get_string(address::STATE),
        postcode: record.get_string(address::POSTCODE),
    }
    .non_empty()
}

pub(crate) fn active_flag(record: &SourceRecord, column: &'static str) -> Result<Option<bool>, RecordError> {
    parse_active_flag(record.get(column).unwrap_or_default())
        .map_err(|message| RecordError::transform(column, message))
}
