use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

/// A single row extracted from a source file. Every field except `extractor`
/// is optional; extractors fill in whatever the source format provides.
#[skip_serializing_none]
#[derive(Debug, PartialEq, Clone, Serialize, Default)]
pub struct Record {
    pub extractor: String,
    /// Filename of the import source, relative to the working directory
    pub file: Option<String>,
    pub lineno: Option<i64>,
    /// Line number counted from the end, negative. Stable for CSV files in
    /// descending date order that grow from the top.
    pub reversed_lineno: Option<i64>,
    pub transaction_id: Option<String>,
    pub date: Option<NaiveDate>,
    /// Date the transaction posted, if distinct from `date`
    pub post_date: Option<NaiveDate>,
    pub timestamp: Option<NaiveDateTime>,
    pub timezone: Option<String>,
    pub desc: Option<String>,
    /// Description as given by the bank, often less readable than `desc`
    pub bank_desc: Option<String>,
    pub amount: Option<Decimal>,
    /// ISO 4217 currency symbol
    pub currency: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub pending: Option<bool>,
    pub status: Option<String>,
    pub r#type: Option<String>,
    pub source_account: Option<String>,
    pub dest_account: Option<String>,
    pub note: Option<String>,
    pub reference: Option<String>,
    pub payee: Option<String>,
    /// General ledger code
    pub gl_code: Option<String>,
    pub name_on_card: Option<String>,
    pub last_four_digits: Option<String>,
    /// Columns the extractor did not map onto any of the fields above
    pub extra: Option<BTreeMap<String, serde_json::Value>>,
}

/// Identity hint for an input file, used for reporting only.
#[derive(Debug, PartialEq, Clone)]
pub struct Fingerprint {
    pub starting_date: NaiveDate,
    pub first_row_hash: String,
}

/// A record field with its static type, as needed by filter coercion.
#[derive(Debug, PartialEq, Clone)]
pub enum FieldValue<'a> {
    Str(&'a str),
    Int(i64),
    Decimal(Decimal),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Bool(bool),
}

impl Record {
    /// Look up a field by its configuration name, keeping its static type.
    /// Unset fields and unknown names come back as `None`.
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        match name {
            "extractor" => Some(FieldValue::Str(&self.extractor)),
            "file" => self.file.as_deref().map(FieldValue::Str),
            "lineno" => self.lineno.map(FieldValue::Int),
            "reversed_lineno" => self.reversed_lineno.map(FieldValue::Int),
            "transaction_id" => self.transaction_id.as_deref().map(FieldValue::Str),
            "date" => self.date.map(FieldValue::Date),
            "post_date" => self.post_date.map(FieldValue::Date),
            "timestamp" => self.timestamp.map(FieldValue::DateTime),
            "timezone" => self.timezone.as_deref().map(FieldValue::Str),
            "desc" => self.desc.as_deref().map(FieldValue::Str),
            "bank_desc" => self.bank_desc.as_deref().map(FieldValue::Str),
            "amount" => self.amount.map(FieldValue::Decimal),
            "currency" => self.currency.as_deref().map(FieldValue::Str),
            "category" => self.category.as_deref().map(FieldValue::Str),
            "subcategory" => self.subcategory.as_deref().map(FieldValue::Str),
            "pending" => self.pending.map(FieldValue::Bool),
            "status" => self.status.as_deref().map(FieldValue::Str),
            "type" => self.r#type.as_deref().map(FieldValue::Str),
            "source_account" => self.source_account.as_deref().map(FieldValue::Str),
            "dest_account" => self.dest_account.as_deref().map(FieldValue::Str),
            "note" => self.note.as_deref().map(FieldValue::Str),
            "reference" => self.reference.as_deref().map(FieldValue::Str),
            "payee" => self.payee.as_deref().map(FieldValue::Str),
            "gl_code" => self.gl_code.as_deref().map(FieldValue::Str),
            "name_on_card" => self.name_on_card.as_deref().map(FieldValue::Str),
            "last_four_digits" => self.last_four_digits.as_deref().map(FieldValue::Str),
            _ => None,
        }
    }

    /// String form of a field, as used by the match predicates.
    pub fn field_str(&self, name: &str) -> Option<String> {
        self.field(name).map(|value| match value {
            FieldValue::Str(s) => s.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Decimal(d) => d.to_string(),
            FieldValue::Date(d) => d.to_string(),
            FieldValue::DateTime(t) => t.to_string(),
            FieldValue::Bool(b) => b.to_string(),
        })
    }

    /// Strip the working-directory prefix from the record's `file`, leaving
    /// paths the way rules and import-src annotations expect them.
    pub fn strip_base_path(mut self, base: &std::path::Path) -> Self {
        if let Some(file) = &self.file {
            let path = std::path::Path::new(file);
            if let Ok(rel) = path.strip_prefix(base) {
                self.file = Some(rel.to_string_lossy().into_owned());
            }
        }
        self
    }
}
