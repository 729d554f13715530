//! Import markers: the durable join key between legacy records and
//! destination entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientImportMetadata {
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_external_ids: Vec<String>,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferrerImportMetadata {
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_external_ids: Vec<String>,
    pub company_external_id: Option<String>,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyImportMetadata {
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_external_ids: Vec<String>,
    pub imported_at: DateTime<Utc>,
}

/// Coordinators are derived from patient rows; `external_id` is the first
/// patient row that named the coordinator, `merged_external_ids` the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorImportMetadata {
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_external_ids: Vec<String>,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationImportMetadata {
    pub external_id: String,
    pub patient_external_id: String,
    pub imported_at: DateTime<Utc>,
}

/// Attached to documents and images that already existed in the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentImportMetadata {
    pub external_id: String,
    pub patient_external_id: String,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ImportMetadata {
    Patient(PatientImportMetadata),
    Referrer(ReferrerImportMetadata),
    Company(CompanyImportMetadata),
    Coordinator(CoordinatorImportMetadata),
    Communication(CommunicationImportMetadata),
    Document(AttachmentImportMetadata),
    Image(AttachmentImportMetadata),
}

impl ImportMetadata {
    pub fn external_id(&self) -> &str {
        match self {
            Self::Patient(m) => &m.external_id,
            Self::Referrer(m) => &m.external_id,
            Self::Company(m) => &m.external_id,
            Self::Coordinator(m) => &m.external_id,
            Self::Communication(m) => &m.external_id,
            Self::Document(m) | Self::Image(m) => &m.external_id,
        }
    }

    fn merged_mut(&mut self) -> Option<&mut Vec<String>> {
        match self {
            Self::Patient(m) => Some(&mut m.merged_external_ids),
            Self::Referrer(m) => Some(&mut m.merged_external_ids),
            Self::Company(m) => Some(&mut m.merged_external_ids),
            Self::Coordinator(m) => Some(&mut m.merged_external_ids),
            Self::Communication(_) | Self::Document(_) | Self::Image(_) => None,
        }
    }

    fn merged(&self) -> &[String] {
        match self {
            Self::Patient(m) => &m.merged_external_ids,
            Self::Referrer(m) => &m.merged_external_ids,
            Self::Company(m) => &m.merged_external_ids,
            Self::Coordinator(m) => &m.merged_external_ids,
            Self::Communication(_) | Self::Document(_) | Self::Image(_) => &[],
        }
    }

    /// Every external id this entity was derived from, primary first.
    pub fn external_ids(&self) -> Vec<&str> {
        std::iter::once(self.external_id())
            .chain(self.merged().iter().map(String::as_str))
            .collect()
    }

    /// Fold the marker of a record resolved onto this entity.
    ///
    /// The primary `external_id` and timestamps never change; a new external
    /// id is remembered in `merged_external_ids`. Variant-specific reference
    /// fields follow the incoming record.
    pub fn absorb(&mut self, incoming: &ImportMetadata) {
        let incoming_id = incoming.external_id().to_string();
        let already_known = self.external_ids().contains(&incoming_id.as_str());
        if !already_known {
            if let Some(merged) = self.merged_mut() {
                merged.push(incoming_id);
            }
        }
        match (self, incoming) {
            (Self::Referrer(current), Self::Referrer(next)) => {
                if next.company_external_id.is_some() {
                    current.company_external_id = next.company_external_id.clone();
                }
            }
            (Self::Communication(current), Self::Communication(next)) => {
                current.patient_external_id = next.patient_external_id.clone();
            }
            (Self::Document(current), Self::Document(next))
            | (Self::Image(current), Self::Image(next)) => {
                current.patient_external_id = next.patient_external_id.clone();
            }
            _ => {}
        }
    }
}
