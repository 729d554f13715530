//! Source extraction: legacy export rows in, canonical [`SourceRecord`]s out.

pub mod api;
pub mod csv;
pub mod sheets;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use futures::stream::BoxStream;
use futures::StreamExt;
use indexmap::IndexMap;

use crate::config::{ApiSourceConfig, MigrationConfig};
use crate::error::{RecordError, SourceError};
use crate::normalization::dates::{parse_date, parse_datetime};
use crate::normalization::Normalizer;

pub use self::api::PaginatedApiExtractor;
pub use self::csv::CsvExtractor;
pub use self::sheets::SheetSpec;

/// Header/key form used for every column lookup: lowercase, trimmed, runs of
/// spaces, dashes and dots folded to a single `_`.
pub fn column_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().trim_start_matches('\u{feff}').chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else if matches!(c, ' ' | '-' | '.' | '_' | '/') {
            pending_sep = true;
        }
    }
    out
}

/// One extracted legacy row with a stable identifier. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub sheet: &'static str,
    /// 1-based row number in the export (header is row 1) or position in the
    /// remote listing.
    pub row: usize,
    pub external_id: String,
    fields: IndexMap<String, String>,
}

impl SourceRecord {
    pub fn new(
        sheet: &'static str,
        row: usize,
        external_id: impl Into<String>,
        fields: IndexMap<String, String>,
    ) -> Self {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (column_key(&k), v))
            .collect();
        Self {
            sheet,
            row,
            external_id: external_id.into(),
            fields,
        }
    }

    /// Trimmed, non-empty cell value.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_string(&self, column: &str) -> Option<String> {
        self.get(column).map(str::to_string)
    }

    pub fn require(&self, column: &'static str) -> Result<&str, RecordError> {
        self.get(column).ok_or(RecordError::MissingField(column))
    }

    pub fn date(&self, column: &'static str) -> Result<Option<NaiveDate>, RecordError> {
        parse_date(self.get(column).unwrap_or_default())
            .map_err(|message| RecordError::transform(column, message))
    }

    pub fn datetime(&self, column: &'static str) -> Result<Option<NaiveDateTime>, RecordError> {
        parse_datetime(self.get(column).unwrap_or_default())
            .map_err(|message| RecordError::transform(column, message))
    }

    /// A foreign-key cell, normalized like an external id.
    pub fn reference(&self, column: &str, norm: &Normalizer) -> Option<String> {
        self.get(column).and_then(|v| norm.external_id(v))
    }

    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }
}

/// What an extractor yields per raw row.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Record(SourceRecord),
    /// Every cell empty; skipped silently.
    Blank { row: usize },
    MissingIdentifier { row: usize },
    /// The row could not be decoded; the rest of the sheet still reads.
    Malformed { row: usize, cause: String },
}

/// Turn a raw row into an [`Extracted`] item for `sheet`.
pub fn classify(
    sheet: &'static SheetSpec,
    row: usize,
    fields: IndexMap<String, String>,
    norm: &Normalizer,
) -> Extracted {
    if fields.values().all(|v| v.trim().is_empty()) {
        return Extracted::Blank { row };
    }
    let record = SourceRecord::new(sheet.name, row, String::new(), fields);
    match record.get(sheet.id_column).and_then(|v| norm.external_id(v)) {
        Some(external_id) => Extracted::Record(SourceRecord {
            external_id,
            ..record
        }),
        None => Extracted::MissingIdentifier { row },
    }
}

pub type ExtractStream = BoxStream<'static, Result<Extracted, SourceError>>;

/// A finite, restartable sequence of rows for one sheet. Every call to
/// [`extract`](SourceExtractor::extract) starts from the beginning.
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn describe(&self) -> String;

    async fn extract(&self) -> Result<ExtractStream, SourceError>;

    /// Non-blank rows, including those without an identifier.
    async fn count(&self) -> Result<u64, SourceError> {
        let mut stream = self.extract().await?;
        let mut n = 0u64;
        while let Some(item) = stream.next().await {
            if !matches!(item?, Extracted::Blank { .. }) {
                n += 1;
            }
        }
        Ok(n)
    }
}

fn reject_workbook(path: &Path) -> Result<(), SourceError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if matches!(ext.as_deref(), Some("xlsx" | "xls" | "xlsm")) {
        return Err(SourceError::Unsupported(format!(
            "{} is a workbook; export each sheet to CSV first",
            path.display()
        )));
    }
    Ok(())
}

/// Where each sheet comes from for this run.
#[derive(Debug, Clone)]
pub struct SourceSet {
    dir: PathBuf,
    overrides: HashMap<&'static str, PathBuf>,
    api: Option<ApiSourceConfig>,
    norm: Normalizer,
}

impl SourceSet {
    pub fn new(dir: impl Into<PathBuf>, norm: Normalizer) -> Self {
        Self {
            dir: dir.into(),
            overrides: HashMap::new(),
            api: None,
            norm,
        }
    }

    /// Build from config. A file (rather than directory) source only becomes
    /// usable once it is bound to a sheet with [`override_sheet`](Self::override_sheet).
    pub fn from_config(config: &MigrationConfig) -> Result<Self, SourceError> {
        let norm = Normalizer::new(config.country_code.clone());
        reject_workbook(&config.source)?;
        let dir = if config.source.is_file() {
            config
                .source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            config.source.clone()
        };
        Ok(Self {
            dir,
            overrides: HashMap::new(),
            api: config.api.clone(),
            norm,
        })
    }

    pub fn override_sheet(&mut self, sheet: &'static SheetSpec, path: PathBuf) -> Result<(), SourceError> {
        reject_workbook(&path)?;
        self.overrides.insert(sheet.name, path);
        Ok(())
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.norm
    }

    pub fn extractor(&self, sheet: &'static SheetSpec) -> Result<Box<dyn SourceExtractor>, SourceError> {
        if let Some(path) = self.overrides.get(sheet.name) {
            return Ok(Box::new(CsvExtractor::new(sheet, path.clone(), self.norm.clone())));
        }
        if let Some(api) = &self.api {
            return Ok(Box::new(PaginatedApiExtractor::new(
                sheet,
                api.clone(),
                self.norm.clone(),
            )?));
        }
        Ok(Box::new(CsvExtractor::new(
            sheet,
            self.dir.join(sheet.file_name),
            self.norm.clone(),
        )))
    }
}
