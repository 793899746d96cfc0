use crate::record::{Fingerprint, Record};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Import id template used when an extractor does not supply its own
pub const DEFAULT_IMPORT_ID_TEMPLATE: &str = "{{ file | as_posix_path }}:{{ reversed_lineno }}";

/// One source file handed to extractors, read into memory so that
/// `process` is trivially restartable.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the working directory, forward slashes
    pub path: String,
    pub content: String,
}

/// Contract between the import core and record extractors.
pub trait Extractor {
    /// Tag recorded on every record this extractor emits
    fn name(&self) -> &str;

    /// May this extractor handle the file?
    fn detect(&self, file: &SourceFile) -> bool;

    /// Identity hint used for reporting; `None` when the file is empty
    fn fingerprint(&self, file: &SourceFile) -> Result<Option<Fingerprint>>;

    fn parse_date(&self, value: &str) -> Result<NaiveDate>;

    /// Default id template for transactions generated from this extractor's
    /// records
    fn import_id_template(&self) -> &str {
        DEFAULT_IMPORT_ID_TEMPLATE
    }

    /// Lazily extract the file's records
    fn process<'a>(
        &'a self,
        file: &'a SourceFile,
    ) -> Result<Box<dyn Iterator<Item = Result<Record>> + 'a>>;
}

/// Generic CSV extractor: a header signature, a column-to-field mapping,
/// and date formats. Unmapped columns land in the record's `extra`.
pub struct CsvExtractor {
    name: String,
    fields: Vec<String>,
    date_format: String,
    datetime_format: String,
    columns: BTreeMap<String, String>,
    timezone: Option<String>,
}

impl CsvExtractor {
    pub fn new(
        name: impl Into<String>,
        fields: &[&str],
        date_format: impl Into<String>,
    ) -> Self {
        CsvExtractor {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            date_format: date_format.into(),
            datetime_format: String::new(),
            columns: BTreeMap::new(),
            timezone: None,
        }
    }

    pub fn datetime_format(mut self, format: impl Into<String>) -> Self {
        self.datetime_format = format.into();
        self
    }

    /// Map a CSV column onto a record field by name
    pub fn column(mut self, column: impl Into<String>, field: impl Into<String>) -> Self {
        self.columns.insert(column.into(), field.into());
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// The Mercury bank statement format
    pub fn mercury() -> Self {
        CsvExtractor::new(
            "mercury",
            &[
                "Date (UTC)",
                "Description",
                "Amount",
                "Status",
                "Source Account",
                "Bank Description",
                "Reference",
                "Note",
                "Last Four Digits",
                "Name On Card",
                "Category",
                "GL Code",
                "Timestamp",
                "Original Currency",
            ],
            "%m-%d-%Y",
        )
        .datetime_format("%m-%d-%Y %H:%M:%S")
        .timezone("UTC")
        .column("Date (UTC)", "date")
        .column("Description", "desc")
        .column("Amount", "amount")
        .column("Status", "status")
        .column("Source Account", "source_account")
        .column("Bank Description", "bank_desc")
        .column("Reference", "reference")
        .column("Note", "note")
        .column("Last Four Digits", "last_four_digits")
        .column("Name On Card", "name_on_card")
        .column("Category", "category")
        .column("GL Code", "gl_code")
        .column("Timestamp", "timestamp")
        .column("Original Currency", "currency")
    }

    /// The Agrimaster export format
    pub fn agrimaster() -> Self {
        CsvExtractor::new(
            "agrimaster_csv",
            &["Account", "Date", "ignore", "Description", "Amount", "Balance"],
            "%d/%m/%Y",
        )
        .column("Date", "date")
        .column("Description", "desc")
        .column("Amount", "amount")
    }

    fn date_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|(_, field)| field.as_str() == "date")
            .map(|(column, _)| column.as_str())
    }

    fn assign(&self, record: &mut Record, field: &str, raw: &str) -> Result<()> {
        match field {
            "transaction_id" => record.transaction_id = Some(raw.to_string()),
            "date" => record.date = Some(self.parse_date(raw)?),
            "post_date" => record.post_date = Some(self.parse_date(raw)?),
            "timestamp" => {
                record.timestamp = Some(
                    NaiveDateTime::parse_from_str(raw, &self.datetime_format)
                        .with_context(|| format!("Invalid timestamp '{raw}'"))?,
                )
            }
            "desc" => record.desc = Some(raw.to_string()),
            "bank_desc" => record.bank_desc = Some(raw.to_string()),
            "amount" => {
                record.amount = Some(
                    raw.replace(',', "")
                        .parse()
                        .with_context(|| format!("Invalid amount '{raw}'"))?,
                )
            }
            "currency" => record.currency = Some(raw.to_string()),
            "category" => record.category = Some(raw.to_string()),
            "subcategory" => record.subcategory = Some(raw.to_string()),
            "pending" => {
                record.pending = Some(
                    raw.to_lowercase()
                        .parse()
                        .with_context(|| format!("Invalid pending value '{raw}'"))?,
                )
            }
            "status" => record.status = Some(raw.to_string()),
            "type" => record.r#type = Some(raw.to_string()),
            "source_account" => record.source_account = Some(raw.to_string()),
            "dest_account" => record.dest_account = Some(raw.to_string()),
            "note" => record.note = Some(raw.to_string()),
            "reference" => record.reference = Some(raw.to_string()),
            "payee" => record.payee = Some(raw.to_string()),
            "gl_code" => record.gl_code = Some(raw.to_string()),
            "name_on_card" => record.name_on_card = Some(raw.to_string()),
            "last_four_digits" => record.last_four_digits = Some(raw.to_string()),
            _ => return Err(anyhow!("Unknown record field '{}' in column mapping", field)),
        }
        Ok(())
    }

    fn process_row(
        &self,
        file: &SourceFile,
        headers: &csv::StringRecord,
        index: i64,
        row_count: i64,
        row: &csv::StringRecord,
    ) -> Result<Record> {
        let mut record = Record {
            extractor: self.name.clone(),
            file: Some(file.path.clone()),
            lineno: Some(index + 2),
            reversed_lineno: Some(index + 1 - row_count),
            timezone: self.timezone.clone(),
            ..Record::default()
        };
        let mut extra = BTreeMap::new();
        for (column, value) in headers.iter().zip(row.iter()) {
            match self.columns.get(column) {
                Some(field) => self.assign(&mut record, field, value).with_context(|| {
                    format!("Bad value in column '{}' of {}", column, file.path)
                })?,
                None => {
                    extra.insert(column.to_string(), serde_json::json!(value));
                }
            }
        }
        if !extra.is_empty() {
            record.extra = Some(extra);
        }
        Ok(record)
    }
}

impl Extractor for CsvExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, file: &SourceFile) -> bool {
        let mut reader = csv::Reader::from_reader(file.content.as_bytes());
        match reader.headers() {
            Ok(headers) => headers.iter().eq(self.fields.iter().map(String::as_str)),
            Err(_) => false,
        }
    }

    fn fingerprint(&self, file: &SourceFile) -> Result<Option<Fingerprint>> {
        let mut reader = csv::Reader::from_reader(file.content.as_bytes());
        let headers = reader.headers()?.clone();
        let mut last_row = None;
        for row in reader.into_records() {
            last_row = Some(row?);
        }
        let Some(row) = last_row else {
            return Ok(None);
        };
        let mut hash = Sha256::new();
        for value in row.iter() {
            hash.update(value.as_bytes());
        }
        let date_column = self
            .date_column()
            .context("No date column configured for fingerprinting")?;
        let date_index = headers
            .iter()
            .position(|h| h == date_column)
            .with_context(|| format!("Column '{date_column}' missing from {}", file.path))?;
        let starting_date = self.parse_date(&row[date_index])?;
        Ok(Some(Fingerprint {
            starting_date,
            first_row_hash: format!("{:x}", hash.finalize()),
        }))
    }

    fn parse_date(&self, value: &str) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(value, &self.date_format)
            .with_context(|| format!("Invalid date '{}' for format '{}'", value, self.date_format))
    }

    fn process<'a>(
        &'a self,
        file: &'a SourceFile,
    ) -> Result<Box<dyn Iterator<Item = Result<Record>> + 'a>> {
        let row_count = csv::Reader::from_reader(file.content.as_bytes())
            .into_records()
            .count() as i64;
        let mut reader = csv::Reader::from_reader(file.content.as_bytes());
        let headers = reader.headers()?.clone();
        let rows = reader.into_records().enumerate().map(move |(index, row)| {
            let row = row.with_context(|| format!("Malformed CSV row in {}", file.path))?;
            self.process_row(file, &headers, index as i64, row_count, &row)
        });
        Ok(Box::new(rows))
    }
}

/// Named extractor lookup with auto-detection for inputs that leave the
/// extractor unspecified.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        ExtractorRegistry {
            extractors: Vec::new(),
        }
    }

    /// Registry with the extractors shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = ExtractorRegistry::new();
        registry.register(Box::new(CsvExtractor::mercury()));
        registry.register(Box::new(CsvExtractor::agrimaster()));
        registry
    }

    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.name() == name)
            .map(|e| &**e)
    }

    /// First registered extractor whose `detect` accepts the file
    pub fn detect(&self, file: &SourceFile) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.detect(file))
            .map(|e| &**e)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        ExtractorRegistry::builtin()
    }
}
