use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::{address_of, emails, import_sheet, notes, phones};
use crate::error::RecordError;
use crate::model::import::CompanyImportMetadata;
use crate::model::{Company, ImportMetadata};
use crate::normalization::Normalizer;
use crate::runner::{MigrationContext, Phase};
use crate::source::sheets::{self, companies as col};
use crate::source::{SheetSpec, SourceRecord};

pub struct ImportCompanies;

pub(crate) fn company_from(
    record: &SourceRecord,
    _norm: &Normalizer,
) -> Result<(Company, ImportMetadata), RecordError> {
    let company = Company {
        name: record.require(col::NAME)?.to_string(),
        abn: record.get_string(col::ABN),
        phones: phones(record, &col::PHONES),
        emails: emails(record, col::EMAIL),
        address: address_of(record),
        notes: notes(record, &[col::NOTES]),
    };
    let import = ImportMetadata::Company(CompanyImportMetadata {
        external_id: record.external_id.clone(),
        merged_external_ids: Vec::new(),
        imported_at: Utc::now(),
    });
    Ok((company, import))
}

#[async_trait]
impl Phase for ImportCompanies {
    fn name(&self) -> &'static str {
        "import-companies"
    }

    fn description(&self) -> &'static str {
        "upsert companies; duplicates merge by name or phone"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::COMPANIES
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        import_sheet(ctx, &sheets::COMPANIES, company_from).await?;
        Ok(())
    }
}
