//! Destination data model.

pub mod entities;
pub mod import;
pub mod link;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::normalization::Normalizer;

pub use entities::{Address, Communication, Company, Coordinator, Document, Image, Patient, Referrer};
pub use import::ImportMetadata;
pub use link::{LinkAttrs, LinkKind, LinkStatus, RelationshipLink};

pub type EntityId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Referrer,
    Company,
    Coordinator,
    Communication,
    Document,
    Image,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        Self::Patient,
        Self::Referrer,
        Self::Company,
        Self::Coordinator,
        Self::Communication,
        Self::Document,
        Self::Image,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Referrer => "referrer",
            Self::Company => "company",
            Self::Coordinator => "coordinator",
            Self::Communication => "communication",
            Self::Document => "document",
            Self::Image => "image",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named secondary index of a lookup index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyIndex {
    Name,
    Phone,
    FileName,
}

impl KeyIndex {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Phone => "phone",
            Self::FileName => "file_name",
        }
    }
}

/// A normalized natural key an entity can be found by when the external id
/// does not match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub index: KeyIndex,
    pub key: String,
}

impl NaturalKey {
    pub fn new(index: KeyIndex, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
        }
    }
}

/// Typed body of a destination entity.
pub trait Entity: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Secondary keys in match priority order. Must be pure functions of the
    /// body so build-time and lookup-time keys agree.
    fn natural_keys(&self, _norm: &Normalizer) -> Vec<NaturalKey> {
        Vec::new()
    }

    /// Fold an incoming version of the same real-world entity into `self`.
    ///
    /// Present scalar values replace stored ones, absent ones keep them, and
    /// accumulating fields are unioned. Absorbing the same value twice is a
    /// no-op.
    fn absorb(&mut self, incoming: Self, norm: &Normalizer);
}

/// Untyped row as the destination store sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub id: Option<EntityId>,
    pub kind: EntityKind,
    pub created_at: DateTime<Utc>,
    pub body: serde_json::Value,
    pub import: Option<ImportMetadata>,
}

/// A destination entity with its typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetEntity<T> {
    /// `None` until the entity is written.
    pub id: Option<EntityId>,
    pub created_at: DateTime<Utc>,
    pub body: T,
    pub import: Option<ImportMetadata>,
}

impl<T: Entity> TargetEntity<T> {
    pub fn new(body: T, import: ImportMetadata, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            created_at,
            body,
            import: Some(import),
        }
    }

    pub fn from_stored(stored: StoredEntity) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: stored.id,
            created_at: stored.created_at,
            body: serde_json::from_value(stored.body)?,
            import: stored.import,
        })
    }

    pub fn to_stored(&self) -> Result<StoredEntity, serde_json::Error> {
        Ok(StoredEntity {
            id: self.id,
            kind: T::KIND,
            created_at: self.created_at,
            body: serde_json::to_value(&self.body)?,
            import: self.import.clone(),
        })
    }

    /// External ids recorded in the import marker, if any.
    pub fn external_ids(&self) -> Vec<&str> {
        self.import
            .as_ref()
            .map(ImportMetadata::external_ids)
            .unwrap_or_default()
    }
}
