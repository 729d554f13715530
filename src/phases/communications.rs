use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::import_sheet;
use crate::error::RecordError;
use crate::index::EntitySet;
use crate::model::import::CommunicationImportMetadata;
use crate::model::{Communication, ImportMetadata, Patient};
use crate::normalization::{Channel, Normalizer};
use crate::resolve::reference;
use crate::runner::{MigrationContext, Phase};
use crate::source::sheets::{self, communications as col};
use crate::source::{SheetSpec, SourceRecord};

pub struct ImportCommunications;

pub(crate) fn communication_from(
    record: &SourceRecord,
    norm: &Normalizer,
    patients: &EntitySet<Patient>,
) -> Result<(Communication, ImportMetadata), RecordError> {
    let patient_external_id = record
        .reference(col::PATIENT_ID, norm)
        .ok_or(RecordError::MissingField(col::PATIENT_ID))?;
    let patient_id = reference(patients, col::PATIENT_ID, Some(&patient_external_id))?;
    let communication = Communication {
        patient_id,
        channel: Channel::parse(record.get(col::CHANNEL).unwrap_or_default()),
        occurred_at: record.datetime(col::DATE)?,
        subject: record.get_string(col::SUBJECT),
        body: record.get_string(col::BODY),
        staff: record.get_string(col::STAFF),
    };
    let import = ImportMetadata::Communication(CommunicationImportMetadata {
        external_id: record.external_id.clone(),
        patient_external_id,
        imported_at: Utc::now(),
    });
    Ok((communication, import))
}

#[async_trait]
impl Phase for ImportCommunications {
    fn name(&self) -> &'static str {
        "import-communications"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["import-patients"]
    }

    fn description(&self) -> &'static str {
        "upsert the communication log; every entry needs a migrated patient"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::COMMUNICATIONS
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        let patients = ctx.load::<Patient>().await?;
        import_sheet(ctx, &sheets::COMMUNICATIONS, |record, norm| {
            communication_from(record, norm, &patients)
        })
        .await?;
        Ok(())
    }
}
