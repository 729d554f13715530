//! Support coordinators have no sheet of their own: each patient row names
//! its coordinator inline, usually with partial contact details. Rows naming
//! the same person merge into one coordinator whose phones, emails and notes
//! accumulate.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::{emails, import_sheet, phones};
use crate::error::RecordError;
use crate::model::import::CoordinatorImportMetadata;
use crate::model::{Coordinator, ImportMetadata};
use crate::normalization::Normalizer;
use crate::runner::{MigrationContext, Phase};
use crate::source::sheets::{self, patients as col};
use crate::source::{SheetSpec, SourceRecord};

pub struct ImportCoordinators;

/// Coordinator named on a patient row. The marker's external id is the
/// patient row's id.
pub(crate) fn coordinator_from(
    record: &SourceRecord,
    norm: &Normalizer,
) -> Result<(Coordinator, ImportMetadata), RecordError> {
    let coordinator = Coordinator {
        first_name: record.get_string(col::COORDINATOR_FIRST_NAME),
        last_name: record.get_string(col::COORDINATOR_LAST_NAME),
        organisation: record.get_string(col::COORDINATOR_ORGANISATION),
        phones: phones(record, &col::COORDINATOR_PHONES),
        emails: emails(record, col::COORDINATOR_EMAIL),
        notes: record.get_string(col::COORDINATOR_NOTES),
    };
    if norm
        .name_key(coordinator.first_name.as_deref(), coordinator.last_name.as_deref())
        .is_none()
    {
        return Err(RecordError::MissingField(col::COORDINATOR_LAST_NAME));
    }
    let import = ImportMetadata::Coordinator(CoordinatorImportMetadata {
        external_id: record.external_id.clone(),
        merged_external_ids: Vec::new(),
        imported_at: Utc::now(),
    });
    Ok((coordinator, import))
}

#[async_trait]
impl Phase for ImportCoordinators {
    fn name(&self) -> &'static str {
        "import-coordinators"
    }

    fn description(&self) -> &'static str {
        "derive support coordinators from patient rows; merge by name"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::PATIENTS
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        import_sheet(ctx, &sheets::PATIENTS, coordinator_from).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::model::EntityKind;
    use crate::phases::testing::Harness;

    const HEADER: &str = "id_Contact,First Name,Last Name,Coordinator First Name,Coordinator Last Name,Coordinator Phone,Coordinator Email\n";

    async fn coordinator_phones(rows: &str) -> Vec<String> {
        let h = Harness::new(&[("Patients.csv", &format!("{HEADER}{rows}"))]);
        let summary = h.run_phase("import-coordinators").await.unwrap();
        assert_eq!(summary.stats.created, 1);
        assert_eq!(summary.stats.merged, 1);
        let coordinators = h.entities(EntityKind::Coordinator).await;
        assert_eq!(coordinators.len(), 1);
        let mut phones: Vec<String> = coordinators[0].body["phones"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap().to_string())
            .collect();
        phones.sort();
        phones
    }

    #[tokio::test]
    async fn merge_is_independent_of_row_order() {
        let r1 = "1,Ann,Lee,Jane,Smith,0412 345 678,\n";
        let r2 = "2,Bob,Ng,JANE,smith,02 9876 5432,jane@care.example\n";
        let forward = coordinator_phones(&format!("{r1}{r2}")).await;
        let backward = coordinator_phones(&format!("{r2}{r1}")).await;
        assert_eq!(forward, backward);
        assert_eq!(forward, vec!["02 9876 5432", "0412 345 678"]);
    }

    #[tokio::test]
    async fn rows_without_a_coordinator_are_skipped() {
        let h = Harness::new(&[(
            "Patients.csv",
            &format!("{HEADER}1,Ann,Lee,,,,\n2,Bob,Ng,Jane,Smith,,\n"),
        )]);
        let summary = h.run_phase("import-coordinators").await.unwrap();
        assert_eq!(summary.stats.created, 1);
        assert_eq!(summary.stats.skipped, 1);
    }
}
