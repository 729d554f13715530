use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::{active_flag, address_of, emails, import_sheet, notes, phones};
use crate::error::RecordError;
use crate::model::import::PatientImportMetadata;
use crate::model::{ImportMetadata, Patient};
use crate::normalization::{Gender, Normalizer};
use crate::runner::{MigrationContext, Phase};
use crate::source::sheets::{self, patients as col};
use crate::source::{SheetSpec, SourceRecord};

pub struct ImportPatients;

pub(crate) fn patient_from(
    record: &SourceRecord,
    norm: &Normalizer,
) -> Result<(Patient, ImportMetadata), RecordError> {
    let first_name = record.get_string(col::FIRST_NAME);
    let last_name = record.get_string(col::LAST_NAME);
    if norm.name_key(first_name.as_deref(), last_name.as_deref()).is_none() {
        return Err(RecordError::MissingField("name"));
    }
    let gender = Gender::parse(record.get(col::GENDER).unwrap_or_default())
        .map_err(|message| RecordError::transform(col::GENDER, message))?;
    let patient = Patient {
        title: record.get_string(col::TITLE),
        first_name,
        last_name,
        preferred_name: record.get_string(col::PREFERRED_NAME),
        date_of_birth: record.date(col::DOB)?,
        gender,
        phones: phones(record, &col::PHONES),
        emails: emails(record, col::EMAIL),
        address: address_of(record),
        notes: notes(record, &col::NOTES),
        active: active_flag(record, col::ACTIVE)?,
    };
    let import = ImportMetadata::Patient(PatientImportMetadata {
        external_id: record.external_id.clone(),
        merged_external_ids: Vec::new(),
        imported_at: Utc::now(),
    });
    Ok((patient, import))
}

#[async_trait]
impl Phase for ImportPatients {
    fn name(&self) -> &'static str {
        "import-patients"
    }

    fn description(&self) -> &'static str {
        "upsert patients; duplicates merge by name and date of birth"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::PATIENTS
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        import_sheet(ctx, &sheets::PATIENTS, patient_from).await?;
        Ok(())
    }
}
