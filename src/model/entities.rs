use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::{Entity, EntityId, EntityKind, KeyIndex, NaturalKey};
use crate::normalization::text::{fold_text, union_emails, union_notes};
use crate::normalization::{Channel, Gender, Normalizer};

fn take<T>(current: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *current = incoming;
    }
}

fn take_string(current: &mut String, incoming: String) {
    if !incoming.trim().is_empty() {
        *current = incoming;
    }
}

fn absorb_notes(current: &mut Option<String>, incoming: Option<String>) {
    *current = union_notes(current.as_deref(), incoming.as_deref());
}

fn phone_keys(phones: &[String], norm: &Normalizer) -> impl Iterator<Item = NaturalKey> {
    phones
        .iter()
        .filter_map(|p| norm.phone_key(p))
        .map(|k| NaturalKey::new(KeyIndex::Phone, k))
        .collect::<Vec<_>>()
        .into_iter()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub suburb: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self.line1.is_none()
            && self.line2.is_none()
            && self.suburb.is_none()
            && self.state.is_none()
            && self.postcode.is_none()
    }

    /// `None` when every line is blank.
    pub fn non_empty(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub preferred_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    pub address: Option<Address>,
    pub notes: Option<String>,
    pub active: Option<bool>,
}

impl Entity for Patient {
    const KIND: EntityKind = EntityKind::Patient;

    /// Name alone is too weak for patients; the date of birth must agree too.
    fn natural_keys(&self, norm: &Normalizer) -> Vec<NaturalKey> {
        let (Some(name), Some(dob)) = (
            norm.name_key(self.first_name.as_deref(), self.last_name.as_deref()),
            self.date_of_birth,
        ) else {
            return Vec::new();
        };
        vec![NaturalKey::new(KeyIndex::Name, format!("{name}|{dob}"))]
    }

    fn absorb(&mut self, incoming: Self, norm: &Normalizer) {
        take(&mut self.title, incoming.title);
        take(&mut self.first_name, incoming.first_name);
        take(&mut self.last_name, incoming.last_name);
        take(&mut self.preferred_name, incoming.preferred_name);
        take(&mut self.date_of_birth, incoming.date_of_birth);
        take(&mut self.gender, incoming.gender);
        take(&mut self.address, incoming.address);
        take(&mut self.active, incoming.active);
        norm.union_phones(&mut self.phones, &incoming.phones);
        union_emails(&mut self.emails, &incoming.emails);
        absorb_notes(&mut self.notes, incoming.notes);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Referrer {
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub specialty: Option<String>,
    pub provider_number: Option<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    pub notes: Option<String>,
}

impl Entity for Referrer {
    const KIND: EntityKind = EntityKind::Referrer;

    fn natural_keys(&self, norm: &Normalizer) -> Vec<NaturalKey> {
        norm.name_key(self.first_name.as_deref(), self.last_name.as_deref())
            .map(|k| NaturalKey::new(KeyIndex::Name, k))
            .into_iter()
            .collect()
    }

    fn absorb(&mut self, incoming: Self, norm: &Normalizer) {
        take(&mut self.title, incoming.title);
        take(&mut self.first_name, incoming.first_name);
        take(&mut self.last_name, incoming.last_name);
        take(&mut self.specialty, incoming.specialty);
        take(&mut self.provider_number, incoming.provider_number);
        norm.union_phones(&mut self.phones, &incoming.phones);
        union_emails(&mut self.emails, &incoming.emails);
        absorb_notes(&mut self.notes, incoming.notes);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    pub abn: Option<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    pub address: Option<Address>,
    pub notes: Option<String>,
}

impl Entity for Company {
    const KIND: EntityKind = EntityKind::Company;

    fn natural_keys(&self, norm: &Normalizer) -> Vec<NaturalKey> {
        let name = fold_text(&self.name);
        let mut keys = Vec::new();
        if !name.is_empty() {
            keys.push(NaturalKey::new(KeyIndex::Name, name));
        }
        keys.extend(phone_keys(&self.phones, norm));
        keys
    }

    fn absorb(&mut self, incoming: Self, norm: &Normalizer) {
        take_string(&mut self.name, incoming.name);
        take(&mut self.abn, incoming.abn);
        take(&mut self.address, incoming.address);
        norm.union_phones(&mut self.phones, &incoming.phones);
        union_emails(&mut self.emails, &incoming.emails);
        absorb_notes(&mut self.notes, incoming.notes);
    }
}

/// Support coordinator. Many patient rows name the same coordinator with
/// partial contact details, so contact fields accumulate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinator {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organisation: Option<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    pub notes: Option<String>,
}

impl Entity for Coordinator {
    const KIND: EntityKind = EntityKind::Coordinator;

    fn natural_keys(&self, norm: &Normalizer) -> Vec<NaturalKey> {
        norm.name_key(self.first_name.as_deref(), self.last_name.as_deref())
            .map(|k| NaturalKey::new(KeyIndex::Name, k))
            .into_iter()
            .collect()
    }

    fn absorb(&mut self, incoming: Self, norm: &Normalizer) {
        take(&mut self.first_name, incoming.first_name);
        take(&mut self.last_name, incoming.last_name);
        take(&mut self.organisation, incoming.organisation);
        norm.union_phones(&mut self.phones, &incoming.phones);
        union_emails(&mut self.emails, &incoming.emails);
        absorb_notes(&mut self.notes, incoming.notes);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Communication {
    pub patient_id: EntityId,
    pub channel: Channel,
    pub occurred_at: Option<NaiveDateTime>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub staff: Option<String>,
}

impl Entity for Communication {
    const KIND: EntityKind = EntityKind::Communication;

    fn absorb(&mut self, incoming: Self, _norm: &Normalizer) {
        self.patient_id = incoming.patient_id;
        self.channel = incoming.channel;
        take(&mut self.occurred_at, incoming.occurred_at);
        take(&mut self.subject, incoming.subject);
        take(&mut self.body, incoming.body);
        take(&mut self.staff, incoming.staff);
    }
}

/// Uploaded file owned by the document system. The migration never rewrites
/// its body; it only attaches an import marker and links it to a patient.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub file_name: String,
    pub title: Option<String>,
    pub content_type: Option<String>,
}

impl Entity for Document {
    const KIND: EntityKind = EntityKind::Document;

    fn natural_keys(&self, _norm: &Normalizer) -> Vec<NaturalKey> {
        file_name_key(&self.file_name)
            .map(|k| NaturalKey::new(KeyIndex::FileName, k))
            .into_iter()
            .collect()
    }

    fn absorb(&mut self, _incoming: Self, _norm: &Normalizer) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub file_name: String,
    pub caption: Option<String>,
    pub taken_on: Option<NaiveDate>,
}

impl Entity for Image {
    const KIND: EntityKind = EntityKind::Image;

    fn natural_keys(&self, _norm: &Normalizer) -> Vec<NaturalKey> {
        file_name_key(&self.file_name)
            .map(|k| NaturalKey::new(KeyIndex::FileName, k))
            .into_iter()
            .collect()
    }

    fn absorb(&mut self, _incoming: Self, _norm: &Normalizer) {}
}

/// Case-folded base name; legacy exports record files with Windows paths.
pub fn file_name_key(raw: &str) -> Option<String> {
    let base = raw
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    if base.is_empty() {
        None
    } else {
        Some(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_absorb_unions_contact_details() {
        let norm = Normalizer::default();
        let mut jane = Coordinator {
            first_name: Some("Jane".into()),
            last_name: Some("Smith".into()),
            phones: vec!["0412 345 678".into()],
            ..Default::default()
        };
        jane.absorb(
            Coordinator {
                first_name: Some("JANE".into()),
                last_name: Some("Smith".into()),
                organisation: Some("Care Co".into()),
                phones: vec!["+61412345678".into(), "02 9000 0000".into()],
                emails: vec!["jane@care.example".into()],
                ..Default::default()
            },
            &norm,
        );
        assert_eq!(jane.phones, vec!["0412 345 678", "02 9000 0000"]);
        assert_eq!(jane.emails, vec!["jane@care.example"]);
        assert_eq!(jane.organisation.as_deref(), Some("Care Co"));
        assert_eq!(jane.first_name.as_deref(), Some("JANE"));
    }

    #[test]
    fn absent_values_do_not_erase_stored_ones() {
        let norm = Normalizer::default();
        let mut patient = Patient {
            first_name: Some("Sam".into()),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 2),
            ..Default::default()
        };
        patient.absorb(
            Patient {
                first_name: None,
                last_name: Some("Lee".into()),
                ..Default::default()
            },
            &norm,
        );
        assert_eq!(patient.first_name.as_deref(), Some("Sam"));
        assert_eq!(patient.last_name.as_deref(), Some("Lee"));
        assert!(patient.date_of_birth.is_some());
    }

    #[test]
    fn patient_natural_key_needs_name_and_birth_date() {
        let norm = Normalizer::default();
        let mut patient = Patient {
            first_name: Some("Sam".into()),
            last_name: Some("Lee".into()),
            ..Default::default()
        };
        assert!(patient.natural_keys(&norm).is_empty());
        patient.date_of_birth = NaiveDate::from_ymd_opt(1990, 1, 2);
        assert_eq!(
            patient.natural_keys(&norm),
            vec![NaturalKey::new(KeyIndex::Name, "sam lee|1990-01-02")]
        );
    }

    #[test]
    fn file_name_keys_strip_directories() {
        assert_eq!(
            file_name_key(r"C:\Exports\Docs\Letter 01.PDF").as_deref(),
            Some("letter 01.pdf")
        );
        assert_eq!(file_name_key("scans/xray.png").as_deref(), Some("xray.png"));
        assert_eq!(file_name_key("  "), None);
    }
}
