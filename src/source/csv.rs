use std::fs::File;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use indexmap::IndexMap;

use super::{classify, column_key, ExtractStream, Extracted, SheetSpec, SourceExtractor};
use crate::error::SourceError;
use crate::normalization::Normalizer;

/// One sheet of the tabular export, saved as CSV with a header row.
pub struct CsvExtractor {
    sheet: &'static SheetSpec,
    path: PathBuf,
    norm: Normalizer,
}

impl CsvExtractor {
    pub fn new(sheet: &'static SheetSpec, path: PathBuf, norm: Normalizer) -> Self {
        Self { sheet, path, norm }
    }
}

#[async_trait]
impl SourceExtractor for CsvExtractor {
    fn describe(&self) -> String {
        format!("{} ({})", self.sheet.name, self.path.display())
    }

    async fn extract(&self) -> Result<ExtractStream, SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let headers: Vec<String> = reader.headers()?.iter().map(column_key).collect();
        let sheet = self.sheet;
        let norm = self.norm.clone();
        let rows = reader
            .into_records()
            .enumerate()
            .map(move |(i, record)| {
                // Row 1 is the header.
                let row = i + 2;
                let record = match record {
                    Ok(record) => record,
                    Err(err) if err.is_io_error() => return Err(err.into()),
                    Err(err) => {
                        return Ok(Extracted::Malformed {
                            row,
                            cause: err.to_string(),
                        })
                    }
                };
                let fields: IndexMap<String, String> = headers
                    .iter()
                    .cloned()
                    .zip(record.iter().map(str::to_string))
                    .collect();
                Ok(classify(sheet, row, fields, &norm))
            });
        Ok(futures::stream::iter(rows).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::sheets;
    use futures::TryStreamExt;

    fn write_sheet(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("practice-migrate-csv-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("Companies.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn yields_records_blanks_and_missing_ids() {
        let path = write_sheet(
            "id_Company,Name,Phone\n\
             1,Acme Health,0412 345 678\n\
             ,,\n\
             ,Nameless Pty,\n\
             2.0,Beta Clinic\n",
        );
        let extractor = CsvExtractor::new(&sheets::COMPANIES, path, Normalizer::default());
        let items: Vec<Extracted> = extractor.extract().await.unwrap().try_collect().await.unwrap();

        assert_eq!(items.len(), 4);
        let Extracted::Record(first) = &items[0] else {
            panic!("expected record");
        };
        assert_eq!(first.external_id, "1");
        assert_eq!(first.get("phone"), Some("0412 345 678"));
        assert_eq!(items[1], Extracted::Blank { row: 3 });
        assert_eq!(items[2], Extracted::MissingIdentifier { row: 4 });
        let Extracted::Record(short) = &items[3] else {
            panic!("expected record");
        };
        assert_eq!(short.external_id, "2");
        assert_eq!(short.get("phone"), None);

        assert_eq!(extractor.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn extraction_restarts_from_the_beginning() {
        let path = write_sheet("id_Company,Name\n1,Acme\n2,Beta\n");
        let extractor = CsvExtractor::new(&sheets::COMPANIES, path, Normalizer::default());
        let first: Vec<Extracted> = extractor.extract().await.unwrap().try_collect().await.unwrap();
        let second: Vec<Extracted> = extractor.extract().await.unwrap().try_collect().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let extractor = CsvExtractor::new(
            &sheets::COMPANIES,
            PathBuf::from("/nonexistent/Companies.csv"),
            Normalizer::default(),
        );
        assert!(matches!(extractor.extract().await, Err(SourceError::Io { .. })));
    }

    #[tokio::test]
    async fn undecodable_rows_do_not_stop_the_sheet() {
        let path = write_sheet("");
        let mut bytes = b"id_Company,Name\n1,Acme\n2,".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(b"\n3,Beta\n");
        std::fs::write(&path, bytes).unwrap();

        let extractor = CsvExtractor::new(&sheets::COMPANIES, path, Normalizer::default());
        let items: Vec<Extracted> = extractor.extract().await.unwrap().try_collect().await.unwrap();
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Extracted::Record(r) if r.external_id == "1"));
        assert!(matches!(&items[1], Extracted::Malformed { row: 3, .. }));
        assert!(matches!(&items[2], Extracted::Record(r) if r.external_id == "3"));
        assert_eq!(extractor.count().await.unwrap(), 3);
    }
}
