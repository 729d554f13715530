//! Documents and images already live in the destination; the legacy sheets
//! only say which patient each file belongs to. These phases never create an
//! attachment. They stamp an import marker on the existing one and link it to
//! its patient.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::error::RecordError;
use crate::index::EntitySet;
use crate::link::LinkSet;
use crate::model::entities::file_name_key;
use crate::model::import::AttachmentImportMetadata;
use crate::model::{
    Document, Entity, Image, ImportMetadata, KeyIndex, LinkAttrs, LinkKind, NaturalKey, Patient,
};
use crate::normalization::Normalizer;
use crate::outcome::RecordOutcome;
use crate::resolve::reference;
use crate::runner::{MigrationContext, Phase};
use crate::source::sheets::{self, attachments as col};
use crate::source::{SheetSpec, SourceRecord};

type Marker = fn(AttachmentImportMetadata) -> ImportMetadata;

struct Relink<'a, T: Entity> {
    patients: &'a EntitySet<Patient>,
    attachments: &'a mut EntitySet<T>,
    links: &'a mut LinkSet,
    marker: Marker,
}

impl<T: Entity> Relink<'_, T> {
    fn row(&mut self, record: &SourceRecord, norm: &Normalizer) -> Result<RecordOutcome, RecordError> {
        let patient_external_id = record
            .reference(col::PATIENT_ID, norm)
            .ok_or(RecordError::MissingField(col::PATIENT_ID))?;
        let patient = reference(self.patients, col::PATIENT_ID, Some(&patient_external_id))?;

        let file_name = record.require(col::FILE_NAME)?;
        let keys: Vec<NaturalKey> = file_name_key(file_name)
            .map(|k| NaturalKey::new(KeyIndex::FileName, k))
            .into_iter()
            .collect();
        let handle = self
            .attachments
            .find_external(&record.external_id)
            .or_else(|| self.attachments.find_natural(&keys))
            .ok_or_else(|| RecordError::unresolved(col::FILE_NAME, file_name))?;
        let attachment = self
            .attachments
            .id_of(handle)
            .ok_or_else(|| RecordError::unresolved(col::FILE_NAME, file_name))?;

        let marker = (self.marker)(AttachmentImportMetadata {
            external_id: record.external_id.clone(),
            patient_external_id,
            linked_at: Utc::now(),
        });
        self.attachments.mark_imported(handle, &marker);

        let attrs = LinkAttrs {
            external_id: Some(record.external_id.clone()),
            ..LinkAttrs::default()
        };
        Ok(match self.links.link(patient, attachment, attrs, Utc::now()) {
            RecordOutcome::Created => RecordOutcome::Created,
            _ => RecordOutcome::Updated,
        })
    }
}

async fn relink<T: Entity>(
    ctx: &mut MigrationContext,
    sheet: &'static SheetSpec,
    kind: LinkKind,
    marker: Marker,
) -> Result<()> {
    let patients = ctx.load::<Patient>().await?;
    let mut attachments = ctx.load::<T>().await?;
    let mut links = ctx.load_links(kind).await?;
    let mut feed = ctx.open(sheet).await?;
    while let Some(record) = feed.next(ctx).await? {
        let mut relink = Relink {
            patients: &patients,
            attachments: &mut attachments,
            links: &mut links,
            marker,
        };
        let outcome = relink
            .row(&record, ctx.norm())
            .unwrap_or_else(RecordError::into_outcome);
        ctx.record(&record, outcome)?;
        ctx.commit_if_full(&mut attachments).await?;
    }
    ctx.commit(&mut attachments).await?;
    ctx.commit_links(&mut links).await?;
    Ok(())
}

pub struct RelinkDocuments;

#[async_trait]
impl Phase for RelinkDocuments {
    fn name(&self) -> &'static str {
        "relink-documents"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["import-patients"]
    }

    fn description(&self) -> &'static str {
        "mark existing documents as migrated and link them to patients"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::DOCUMENTS
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        relink::<Document>(ctx, &sheets::DOCUMENTS, LinkKind::PatientDocument, ImportMetadata::Document).await
    }
}

pub struct RelinkImages;

#[async_trait]
impl Phase for RelinkImages {
    fn name(&self) -> &'static str {
        "relink-images"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["import-patients"]
    }

    fn description(&self) -> &'static str {
        "mark existing images as migrated and link them to patients"
    }

    fn sheet(&self) -> &'static SheetSpec {
        &sheets::IMAGES
    }

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()> {
        relink::<Image>(ctx, &sheets::IMAGES, LinkKind::PatientImage, ImportMetadata::Image).await
    }
}
