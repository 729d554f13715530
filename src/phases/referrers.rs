use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::{emails, import_sheet, notes, phones};
use crate::error::RecordError;
use crate::model::import::ReferrerImportMetadata;
use crate::model::{ImportMetadata, Referrer};
use crate::normalization::Normalizer;
use crate::runner::{MigrationContext, Phase};
use crate::source::sheets::{self, referrers as col};
use crate::source::{SheetSpec, SourceRecord};

pub struct ImportReferrers;

pub(crate) fn referrer_from(
    record: &SourceRecord,
    norm: &Normalizer,
) -> Result<(Referrer, ImportMetadata), RecordError> {
    let referrer = Referrer {
        title: record.get_string(col::TITLE),
        first_name: record.get_string(col::FIRST_NAME),
        last_name: Some(record.require(col::LAST_NAME)?.to_string()),
        specialty: record.get_string(col::SPECIALTY),
        provider_number: record.get_string(col::PROVIDER_NUMBER),
        phones: phones(record, &col::PHONES),
        emails: emails(record, col::EMAIL),
        notes: notes(record, &[col::NOTES]),
    };
    let import = ImportMetadata::Referrer(ReferrerImportMetadata {
        external_id: record.external_id.clone(),
        merged_external_ids: Vec::new(),
        company_external_id: record.reference(col::COMPANY_ID, norm),
        imported_at: Utc::now(),
    });
    Ok((referrer, import))
}

#[async_trait]
impl Phase for ImportReferrers {
    fn name(&self) -> &'static str {
        "import-referrers"
    }

    fn description(&self) -> &'static str {
        "upsert referring practitioners; duplicates merge by name"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::REFERRERS
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        import_sheet(ctx, &sheets::REFERRERS, referrer_from).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{EntityKind, ImportMetadata};
    use crate::phases::testing::Harness;

    const REFERRERS: &str = "id_Referrer,id_Company,Title,First Name,Last Name,Specialty,Phone\n\
                             10,1.0,Dr,Priya,Nair,GP,02 9000 0001\n\
                             11,,Dr,Tom,Baker,Cardiology,\n\
                             12,2,,,,,\n";

    #[tokio::test]
    async fn referrers_without_a_surname_are_skipped() {
        let h = Harness::new(&[("Referrers.csv", REFERRERS)]);
        let summary = h.run_phase("import-referrers").await.unwrap();
        assert_eq!(summary.stats.counts(), (2, 0, 1, 0));

        let referrers = h.entities(EntityKind::Referrer).await;
        let nair = referrers
            .iter()
            .find(|r| r.body["last_name"] == "Nair")
            .unwrap();
        let Some(ImportMetadata::Referrer(meta)) = &nair.import else {
            panic!("expected referrer marker");
        };
        assert_eq!(meta.company_external_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn rerunning_updates_instead_of_duplicating() {
        let h = Harness::new(&[("Referrers.csv", REFERRERS)]);
        h.run_phase("import-referrers").await.unwrap();
        let first = h.store.snapshot().await;

        let again = h.run_phase("import-referrers").await.unwrap();
        assert_eq!(again.stats.created, 0);
        assert_eq!(again.stats.updated, 2);
        assert_eq!(h.store.snapshot().await, first);
    }
}
