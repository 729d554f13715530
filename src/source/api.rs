use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use indexmap::IndexMap;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{classify, column_key, ExtractStream, Extracted, SheetSpec, SourceExtractor};
use crate::config::ApiSourceConfig;
use crate::error::SourceError;
use crate::normalization::Normalizer;

/// Remote listing endpoint that serves one sheet as JSON pages.
pub struct PaginatedApiExtractor {
    sheet: &'static SheetSpec,
    client: Client,
    base: Url,
    config: ApiSourceConfig,
    norm: Normalizer,
}

impl PaginatedApiExtractor {
    pub fn new(
        sheet: &'static SheetSpec,
        config: ApiSourceConfig,
        norm: Normalizer,
    ) -> Result<Self, SourceError> {
        let mut raw = config.base_url.trim().to_string();
        // `Url::join` replaces the last segment unless the base ends in a slash.
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self {
            sheet,
            client,
            base,
            config,
            norm,
        })
    }

    fn first_page(&self) -> Result<Url, SourceError> {
        let mut url = self.base.join(self.sheet.resource)?;
        url.query_pairs_mut()
            .append_pair("per_page", &self.config.page_size.to_string());
        Ok(url)
    }
}

struct PageCursor {
    next: Option<Url>,
    fetched: u32,
    row: usize,
    buffer: VecDeque<Extracted>,
}

/// Records and next link of one JSON page.
#[derive(Debug, PartialEq)]
struct Page {
    records: Vec<Value>,
    next: Option<String>,
}

fn parse_page(resource: &str, body: Value) -> Result<Page, SourceError> {
    let next = body
        .pointer("/links/next")
        .or_else(|| body.get("next"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);
    let records = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => [resource, "results", "data"]
            .into_iter()
            .find_map(|key| match map.remove(key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                SourceError::Unsupported(format!("page for `{resource}` has no record array"))
            })?,
        other => {
            return Err(SourceError::Unsupported(format!(
                "page for `{resource}` is not an object: {other}"
            )))
        }
    };
    Ok(Page { records, next })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Nested objects become `parent_child` columns; scalar arrays are joined
/// with `; `.
fn flatten_record(record: &Value) -> IndexMap<String, String> {
    fn walk(prefix: &str, value: &Value, out: &mut IndexMap<String, String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let name = if prefix.is_empty() {
                        column_key(key)
                    } else {
                        format!("{prefix}_{}", column_key(key))
                    };
                    walk(&name, child, out);
                }
            }
            Value::Array(items) => {
                let joined: Vec<String> = items.iter().filter_map(scalar_text).collect();
                if !joined.is_empty() {
                    out.insert(prefix.to_string(), joined.join("; "));
                }
            }
            scalar => {
                if let Some(text) = scalar_text(scalar) {
                    out.insert(prefix.to_string(), text);
                }
            }
        }
    }
    let mut out = IndexMap::new();
    walk("", record, &mut out);
    out
}

#[async_trait]
impl SourceExtractor for PaginatedApiExtractor {
    fn describe(&self) -> String {
        format!("{} ({}{})", self.sheet.name, self.base, self.sheet.resource)
    }

    async fn extract(&self) -> Result<ExtractStream, SourceError> {
        let cursor = PageCursor {
            next: Some(self.first_page()?),
            fetched: 0,
            row: 0,
            buffer: VecDeque::new(),
        };
        let client = self.client.clone();
        let api_key = self.config.api_key.clone();
        let max_pages = self.config.max_pages;
        let sheet = self.sheet;
        let norm = self.norm.clone();

        let stream = futures::stream::try_unfold(cursor, move |mut cursor| {
            let client = client.clone();
            let api_key = api_key.clone();
            let norm = norm.clone();
            async move {
                loop {
                    if let Some(item) = cursor.buffer.pop_front() {
                        return Ok(Some((item, cursor)));
                    }
                    let Some(url) = cursor.next.take() else {
                        return Ok(None);
                    };
                    if cursor.fetched >= max_pages {
                        return Err(SourceError::PageLimit {
                            resource: sheet.resource.to_string(),
                            max_pages,
                        });
                    }
                    cursor.fetched += 1;

                    let mut request = client.get(url.clone());
                    if let Some(key) = &api_key {
                        request = request.bearer_auth(key);
                    }
                    let body: Value = request.send().await?.error_for_status()?.json().await?;
                    let page = parse_page(sheet.resource, body)?;
                    debug!(
                        resource = sheet.resource,
                        page = cursor.fetched,
                        records = page.records.len(),
                        "fetched source page"
                    );
                    for record in &page.records {
                        cursor.row += 1;
                        cursor
                            .buffer
                            .push_back(classify(sheet, cursor.row, flatten_record(record), &norm));
                    }
                    cursor.next = page.next.map(|next| url.join(&next)).transpose()?;
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pages_accept_resource_results_or_data_keys() {
        let page = parse_page(
            "contacts",
            json!({"contacts": [{"id_Contact": 1}], "links": {"next": "/contacts?page=2"}}),
        )
        .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next.as_deref(), Some("/contacts?page=2"));

        let page = parse_page("contacts", json!({"results": [], "next": null})).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.next, None);

        let page = parse_page("contacts", json!([{"a": 1}, {"a": 2}])).unwrap();
        assert_eq!(page.records.len(), 2);

        assert!(parse_page("contacts", json!({"count": 3})).is_err());
    }

    #[test]
    fn nested_records_flatten_to_columns() {
        let fields = flatten_record(&json!({
            "id_Contact": 42,
            "First Name": "Ann",
            "coordinator": {"first_name": "Jane", "phone": "0412 345 678"},
            "tags": ["a", "b"],
            "deleted": null
        }));
        assert_eq!(fields.get("id_contact").map(String::as_str), Some("42"));
        assert_eq!(fields.get("first_name").map(String::as_str), Some("Ann"));
        assert_eq!(
            fields.get("coordinator_first_name").map(String::as_str),
            Some("Jane")
        );
        assert_eq!(fields.get("tags").map(String::as_str), Some("a; b"));
        assert!(!fields.contains_key("deleted"));
    }

    #[test]
    fn first_page_url_keeps_base_path() {
        let extractor = PaginatedApiExtractor::new(
            &super::super::sheets::PATIENTS,
            ApiSourceConfig {
                base_url: "https://legacy.example.com/api/v2".into(),
                api_key: None,
                page_size: 50,
                max_pages: 10,
                timeout: std::time::Duration::from_secs(5),
            },
            Normalizer::default(),
        )
        .unwrap();
        assert_eq!(
            extractor.first_page().unwrap().as_str(),
            "https://legacy.example.com/api/v2/contacts?per_page=50"
        );
    }
}
