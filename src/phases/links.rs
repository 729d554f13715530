//! Link phases. Each reads a sheet, resolves both endpoints against fresh
//! indexes of committed entities, upserts the link and finishes with the
//! primary-designation pass.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::active_flag;
use super::coordinators::coordinator_from;
use crate::error::RecordError;
use crate::index::EntitySet;
use crate::model::{
    Company, Coordinator, Entity, EntityId, LinkAttrs, LinkKind, LinkStatus, Patient, Referrer,
};
use crate::normalization::Normalizer;
use crate::resolve::reference;
use crate::runner::{MigrationContext, Phase};
use crate::source::sheets::{self, patients as patient_col, referrals as referral_col, referrers as referrer_col};
use crate::source::{SheetSpec, SourceRecord};

type Endpoints = (EntityId, EntityId, LinkAttrs);

fn status_of(flag: Option<bool>) -> LinkStatus {
    match flag {
        Some(false) => LinkStatus::Inactive,
        _ => LinkStatus::Active,
    }
}

async fn link_sheet<F>(
    ctx: &mut MigrationContext,
    sheet: &'static SheetSpec,
    kind: LinkKind,
    endpoints: F,
) -> Result<()>
where
    F: Fn(&SourceRecord, &Normalizer) -> Result<Endpoints, RecordError> + Send + Sync,
{
    let mut links = ctx.load_links(kind).await?;
    let mut feed = ctx.open(sheet).await?;
    while let Some(record) = feed.next(ctx).await? {
        let outcome = match endpoints(&record, ctx.norm()) {
            Ok((subject, object, attrs)) => links.link(subject, object, attrs, Utc::now()),
            Err(err) => err.into_outcome(),
        };
        ctx.record(&record, outcome)?;
    }
    let flipped = links.designate_primaries();
    info!(kind = %kind, flipped, "primary links designated");
    ctx.commit_links(&mut links).await?;
    Ok(())
}

/// Id of the entity whose marker carries the reference in `column`.
fn referenced<T: Entity>(
    set: &EntitySet<T>,
    record: &SourceRecord,
    column: &'static str,
    norm: &Normalizer,
) -> Result<EntityId, RecordError> {
    reference(set, column, record.reference(column, norm).as_deref())
}

pub struct LinkReferrerCompanies;

#[async_trait]
impl Phase for LinkReferrerCompanies {
    fn name(&self) -> &'static str {
        "link-referrer-companies"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["import-referrers", "import-companies"]
    }

    fn description(&self) -> &'static str {
        "link referrers to their practice; latest association is primary"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::REFERRERS
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        let referrers = ctx.load::<Referrer>().await?;
        let companies = ctx.load::<Company>().await?;
        link_sheet(ctx, &sheets::REFERRERS, LinkKind::ReferrerCompany, |record, norm| {
            let company = referenced(&companies, record, referrer_col::COMPANY_ID, norm)?;
            let referrer = reference(&referrers, sheets::REFERRERS.id_column, Some(&record.external_id))?;
            Ok((
                referrer,
                company,
                LinkAttrs {
                    status: LinkStatus::Active,
                    relationship_date: record.date(referrer_col::COMPANY_SINCE)?,
                    reason: None,
                    external_id: Some(record.external_id.clone()),
                },
            ))
        })
        .await
    }
}

pub struct LinkPatientReferrers;

#[async_trait]
impl Phase for LinkPatientReferrers {
    fn name(&self) -> &'static str {
        "link-patient-referrers"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["import-patients", "import-referrers"]
    }

    fn description(&self) -> &'static str {
        "link patients to referrers from referrals; latest active referral is primary"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::REFERRALS
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        let patients = ctx.load::<Patient>().await?;
        let referrers = ctx.load::<Referrer>().await?;
        link_sheet(ctx, &sheets::REFERRALS, LinkKind::PatientReferrer, |record, norm| {
            let patient = referenced(&patients, record, referral_col::PATIENT_ID, norm)?;
            let referrer = referenced(&referrers, record, referral_col::REFERRER_ID, norm)?;
            Ok((
                patient,
                referrer,
                LinkAttrs {
                    status: status_of(active_flag(record, referral_col::ACTIVE)?),
                    relationship_date: record.date(referral_col::DATE)?,
                    reason: record.get_string(referral_col::REASON),
                    external_id: Some(record.external_id.clone()),
                },
            ))
        })
        .await
    }
}

pub struct LinkPatientCoordinators;

/// Coordinator named on a patient row: by the row's id in a coordinator
/// marker, otherwise by name.
fn coordinator_for(
    coordinators: &EntitySet<Coordinator>,
    record: &SourceRecord,
    norm: &Normalizer,
) -> Result<EntityId, RecordError> {
    let (named, _) = coordinator_from(record, norm)?;
    coordinators
        .find_external(&record.external_id)
        .or_else(|| coordinators.find_natural(&named.natural_keys(norm)))
        .and_then(|h| coordinators.id_of(h))
        .ok_or_else(|| {
            let name = norm
                .name_key(named.first_name.as_deref(), named.last_name.as_deref())
                .unwrap_or_default();
            RecordError::unresolved("coordinator", name)
        })
}

#[async_trait]
impl Phase for LinkPatientCoordinators {
    fn name(&self) -> &'static str {
        "link-patient-coordinators"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["import-patients", "import-coordinators"]
    }

    fn description(&self) -> &'static str {
        "link patients to support coordinators; latest active one is current"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::PATIENTS
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        let patients = ctx.load::<Patient>().await?;
        let coordinators = ctx.load::<Coordinator>().await?;
        link_sheet(ctx, &sheets::PATIENTS, LinkKind::PatientCoordinator, |record, norm| {
            let coordinator = coordinator_for(&coordinators, record, norm)?;
            let patient = reference(&patients, sheets::PATIENTS.id_column, Some(&record.external_id))?;
            Ok((
                patient,
                coordinator,
                LinkAttrs {
                    status: status_of(active_flag(record, patient_col::COORDINATOR_ACTIVE)?),
                    relationship_date: record.date(patient_col::COORDINATOR_START_DATE)?,
                    reason: None,
                    external_id: Some(record.external_id.clone()),
                },
            ))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::model::EntityKind;
    use crate::phases::testing::Harness;
    use crate::runner::PhaseRunner;
    use crate::store::{Db, SharedStore, TargetStore};

    const PATIENTS: &str = "id_Contact,First Name,Last Name,Coordinator First Name,Coordinator Last Name,Coordinator Phone,Coordinator Start Date\n\
                            1,Ann,Lee,Jane,Smith,0412 345 678,01/02/2023\n\
                            2,Bob,Ng,Jane,Smith,02 9876 5432,\n\
                            3,Cy,Orr,,,,\n";
    const REFERRERS: &str = "id_Referrer,id_Company,First Name,Last Name,Company Start Date\n\
                             10,1,Priya,Nair,2020-01-01\n\
                             11,9,Tom,Baker,\n";
    const COMPANIES: &str = "id_Company,Name\n1,Harbour Medical\n";
    const REFERRALS: &str = "id,id_Contact,id_Referrer,Referral Date,Active,Reason\n\
                             500,1,10,2023-01-01,yes,Back pain\n\
                             501,1,11,2024-06-01,yes,Review\n\
                             502,1,10,2024-05-01,yes,Follow-up\n\
                             503,2,10,2024-07-01,no,Closed\n\
                             504,3,99,2024-07-01,yes,\n";

    fn harness() -> Harness {
        Harness::new(&[
            ("Patients.csv", PATIENTS),
            ("Referrers.csv", REFERRERS),
            ("Companies.csv", COMPANIES),
            ("Referrals.csv", REFERRALS),
        ])
    }

    #[tokio::test]
    async fn latest_referral_is_primary_and_reruns_do_not_duplicate() {
        let h = harness();
        h.run_phases(&["import-patients", "import-referrers", "link-patient-referrers"])
            .await
            .unwrap();

        let links = h.links(LinkKind::PatientReferrer).await;
        // 502 repeats the 1 -> 10 pair and updates it; 504 is unresolved.
        assert_eq!(links.len(), 3);
        let primary: Vec<_> = links.iter().filter(|l| l.is_primary).collect();
        // Patient 2 has no active referral.
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].external_id.as_deref(), Some("501"));
        let repeated = links.iter().find(|l| l.external_id.as_deref() == Some("502")).unwrap();
        assert_eq!(repeated.reason.as_deref(), Some("Follow-up"));

        let before = h.store.snapshot().await;
        let again = h.run_phase("link-patient-referrers").await.unwrap();
        assert_eq!(again.stats.created, 0);
        assert_eq!(again.stats.unresolved, 1);
        assert_eq!(h.store.snapshot().await, before);
    }

    #[tokio::test]
    async fn coordinators_link_by_marker_and_skip_rows_without_one() {
        let h = harness();
        let summaries = h
            .run_phases(&["import-patients", "import-coordinators", "link-patient-coordinators"])
            .await
            .unwrap();
        let stats = summaries[2].stats;
        assert_eq!(stats.created, 2);
        assert_eq!(stats.skipped, 1);

        let links = h.links(LinkKind::PatientCoordinator).await;
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.is_primary));
        let coordinators = h.entities(EntityKind::Coordinator).await;
        assert_eq!(coordinators.len(), 1);
        assert!(links.iter().all(|l| Some(l.object_id) == coordinators[0].id));
    }

    #[tokio::test]
    async fn referrers_link_to_known_companies_only() {
        let h = harness();
        let summaries = h
            .run_phases(&["import-referrers", "import-companies", "link-referrer-companies"])
            .await
            .unwrap();
        let stats = summaries[2].stats;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.unresolved, 1);
        let links = h.links(LinkKind::ReferrerCompany).await;
        assert_eq!(links.len(), 1);
        assert!(links[0].is_primary);
        assert_eq!(links[0].relationship_date.map(|d| d.to_string()).as_deref(), Some("2020-01-01"));
    }

    async fn ids_by_row(store: &dyn TargetStore, kind: EntityKind) -> HashMap<String, EntityId> {
        store
            .scan(kind)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.import.unwrap().external_id().to_string(), e.id.unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn changed_referrals_relink_in_sqlite() {
        let h = Harness::new(&[
            ("Patients.csv", "id_Contact,First Name,Last Name\n1,Ann,Lee\n2,Bob,Ng\n"),
            ("Referrers.csv", "id_Referrer,First Name,Last Name\n10,Priya,Nair\n11,Tom,Baker\n"),
            (
                "Referrals.csv",
                "id,id_Contact,id_Referrer,Referral Date\n500,1,10,2024-01-01\n501,2,11,2024-03-01\n",
            ),
        ]);
        let db: SharedStore = Arc::new(Db::connect("sqlite::memory:").await.unwrap());
        let runner = PhaseRunner::standard();
        let names: Vec<String> = ["import-patients", "import-referrers", "link-patient-referrers"]
            .iter()
            .map(|n| n.to_string())
            .collect();
        let mut ctx = h.context_with(h.config.clone(), db.clone());
        runner.run_selected(&mut ctx, &names).await.unwrap();
        assert_eq!(db.count_links(LinkKind::PatientReferrer).await.unwrap(), 2);

        // Row 500 moves to the other patient; new row 502 takes its old pair.
        h.write(
            "Referrals.csv",
            "id,id_Contact,id_Referrer,Referral Date\n\
             500,2,10,2024-05-01\n\
             501,2,11,2024-03-01\n\
             502,1,10,2024-02-01\n",
        );
        let mut ctx = h.context_with(h.config.clone(), db.clone());
        let summary = runner
            .run_phase(&mut ctx, "link-patient-referrers")
            .await
            .unwrap();
        assert_eq!((summary.stats.created, summary.stats.updated), (1, 2));

        let patient = ids_by_row(db.as_ref(), EntityKind::Patient).await;
        let referrer = ids_by_row(db.as_ref(), EntityKind::Referrer).await;
        let links = db.scan_links(LinkKind::PatientReferrer).await.unwrap();
        assert_eq!(links.len(), 3);
        let row = |id: &str| {
            links
                .iter()
                .find(|l| l.external_id.as_deref() == Some(id))
                .map(|l| (l.subject_id, l.object_id, l.is_primary))
                .unwrap()
        };
        assert_eq!(row("500"), (patient["2"], referrer["10"], true));
        assert_eq!(row("501"), (patient["2"], referrer["11"], false));
        assert_eq!(row("502"), (patient["1"], referrer["10"], true));
    }
}
