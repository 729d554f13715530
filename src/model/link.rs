use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityId, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    PatientReferrer,
    PatientCoordinator,
    ReferrerCompany,
    PatientDocument,
    PatientImage,
}

impl LinkKind {
    pub const ALL: [LinkKind; 5] = [
        Self::PatientReferrer,
        Self::PatientCoordinator,
        Self::ReferrerCompany,
        Self::PatientDocument,
        Self::PatientImage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PatientReferrer => "patient_referrer",
            Self::PatientCoordinator => "patient_coordinator",
            Self::ReferrerCompany => "referrer_company",
            Self::PatientDocument => "patient_document",
            Self::PatientImage => "patient_image",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == raw.trim())
    }

    /// (subject, object) entity kinds.
    pub fn endpoints(self) -> (EntityKind, EntityKind) {
        match self {
            Self::PatientReferrer => (EntityKind::Patient, EntityKind::Referrer),
            Self::PatientCoordinator => (EntityKind::Patient, EntityKind::Coordinator),
            Self::ReferrerCompany => (EntityKind::Referrer, EntityKind::Company),
            Self::PatientDocument => (EntityKind::Patient, EntityKind::Document),
            Self::PatientImage => (EntityKind::Patient, EntityKind::Image),
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Active,
    Inactive,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Association between two migrated entities.
///
/// At most one link per `(kind, subject_id, object_id)`, and at most one
/// `is_primary` link per `(kind, subject_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipLink {
    pub id: Option<i64>,
    pub kind: LinkKind,
    pub subject_id: EntityId,
    pub object_id: EntityId,
    pub status: LinkStatus,
    pub relationship_date: Option<NaiveDate>,
    pub is_primary: bool,
    pub reason: Option<String>,
    /// Legacy id of the row that produced the link, when it had one.
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Attributes supplied when linking; everything but the endpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkAttrs {
    pub status: LinkStatus,
    pub relationship_date: Option<NaiveDate>,
    pub reason: Option<String>,
    pub external_id: Option<String>,
}
