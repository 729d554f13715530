//! Key and value normalization shared by extraction, indexing and resolution.
//!
//! Lookup keys must be built identically at index-build time and at lookup
//! time, so every key goes through [`Normalizer`].

pub mod codes;
pub mod dates;
pub mod phone;
pub mod text;

pub use codes::{Channel, Gender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalizer {
    pub country_code: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            country_code: phone::DEFAULT_COUNTRY_CODE.to_string(),
        }
    }
}

impl Normalizer {
    pub fn new(country_code: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
        }
    }

    pub fn phone_key(&self, raw: &str) -> Option<String> {
        phone::phone_key(raw, &self.country_code)
    }

    pub fn name_key(&self, first: Option<&str>, last: Option<&str>) -> Option<String> {
        text::name_key(first, last)
    }

    pub fn external_id(&self, raw: &str) -> Option<String> {
        text::normalize_external_id(raw)
    }

    pub fn union_phones(&self, existing: &mut Vec<String>, incoming: &[String]) {
        phone::union_phones(existing, incoming, &self.country_code)
    }
}
