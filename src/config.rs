pub mod includes;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key carrying the stable import identifier in ledger files
pub const IMPORT_ID_KEY: &str = "import-id";
/// Metadata key annotating the source file(s) of a generated entry
pub const IMPORT_SRC_KEY: &str = "import-src";
/// Metadata key holding the comma-separated override flag set
pub const IMPORT_OVERRIDE_KEY: &str = "import-override";

/// String match pattern. A bare string is a regex anchored at the start of
/// the value.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StrMatch {
    Bare(String),
    Regex {
        regex: String,
    },
    Equals {
        equals: String,
    },
    Prefix {
        prefix: String,
    },
    Suffix {
        suffix: String,
    },
    Contains {
        contains: String,
    },
    OneOf {
        one_of: Vec<String>,
        #[serde(default)]
        regex: bool,
        #[serde(default)]
        ignore_case: bool,
    },
    DateBefore {
        date_before: String,
        format: String,
    },
    DateAfter {
        date_after: String,
        format: String,
    },
    DateSameDay {
        date_same_day: String,
        format: String,
    },
    DateSameMonth {
        date_same_month: String,
        format: String,
    },
    DateSameYear {
        date_same_year: String,
        format: String,
    },
}

/// File match pattern. A bare string is a glob over path components.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FileMatch {
    Glob(String),
    Equals { equals: String },
    Regex { regex: String },
}

/// Per-field patterns forming one rule map. A record matches iff every
/// present pattern passes against the corresponding field.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TxnMatchRule {
    pub extractor: Option<StrMatch>,
    pub file: Option<StrMatch>,
    pub date: Option<StrMatch>,
    pub post_date: Option<StrMatch>,
    pub timezone: Option<StrMatch>,
    pub desc: Option<StrMatch>,
    pub bank_desc: Option<StrMatch>,
    pub amount: Option<StrMatch>,
    pub currency: Option<StrMatch>,
    pub category: Option<StrMatch>,
    pub subcategory: Option<StrMatch>,
    pub status: Option<StrMatch>,
    pub r#type: Option<StrMatch>,
    pub source_account: Option<StrMatch>,
    pub dest_account: Option<StrMatch>,
    pub note: Option<StrMatch>,
    pub reference: Option<StrMatch>,
    pub payee: Option<StrMatch>,
    pub gl_code: Option<StrMatch>,
    pub name_on_card: Option<StrMatch>,
    pub last_four_digits: Option<StrMatch>,
    pub transaction_id: Option<StrMatch>,
}

impl TxnMatchRule {
    /// The (field name, pattern) pairs actually present in this rule map
    pub fn patterns(&self) -> impl Iterator<Item = (&'static str, &StrMatch)> {
        [
            ("extractor", &self.extractor),
            ("file", &self.file),
            ("date", &self.date),
            ("post_date", &self.post_date),
            ("timezone", &self.timezone),
            ("desc", &self.desc),
            ("bank_desc", &self.bank_desc),
            ("amount", &self.amount),
            ("currency", &self.currency),
            ("category", &self.category),
            ("subcategory", &self.subcategory),
            ("status", &self.status),
            ("type", &self.r#type),
            ("source_account", &self.source_account),
            ("dest_account", &self.dest_account),
            ("note", &self.note),
            ("reference", &self.reference),
            ("payee", &self.payee),
            ("gl_code", &self.gl_code),
            ("name_on_card", &self.name_on_card),
            ("last_four_digits", &self.last_four_digits),
            ("transaction_id", &self.transaction_id),
        ]
        .into_iter()
        .filter_map(|(name, pattern)| pattern.as_ref().map(|p| (name, p)))
        .collect::<Vec<_>>()
        .into_iter()
    }
}

/// Subrule of a list-form match: a condition plus variables to bind when it
/// is the first to succeed. Variable values are re-rendered under the record
/// context before binding.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TxnMatchVars {
    pub cond: TxnMatchRule,
    pub vars: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RuleMatch {
    Single(TxnMatchRule),
    Multi(Vec<TxnMatchVars>),
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AmountTemplate {
    pub number: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PostingTemplate {
    pub account: Option<String>,
    pub amount: Option<AmountTemplate>,
    pub price: Option<AmountTemplate>,
    pub cost: Option<String>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetadataItemTemplate {
    pub name: String,
    pub value: String,
}

/// Transaction template. Every string field is an expression template
/// rendered under the record context.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TransactionTemplate {
    /// Import id used for de-duplication
    pub id: Option<String>,
    pub date: Option<String>,
    pub flag: Option<String>,
    pub narration: Option<String>,
    pub payee: Option<String>,
    pub tags: Option<Vec<String>>,
    pub links: Option<Vec<String>>,
    pub metadata: Option<Vec<MetadataItemTemplate>>,
    pub postings: Option<Vec<PostingTemplate>>,
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DeleteTransactionTemplate {
    pub id: Option<String>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AddTxn {
        /// Output file override; falls back to the input's `default_file`
        file: Option<String>,
        txn: TransactionTemplate,
    },
    DelTxn {
        #[serde(default)]
        txn: DeleteTransactionTemplate,
    },
    Ignore,
}

#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

/// One field-level predicate. `field` and `value` are templates; the value
/// is coerced to the record field's static type before comparing.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FilterPredicate {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

/// Either a predicate list, or a single expression that renders into one
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum InputFilter {
    Expr(String),
    Predicates(Vec<FilterPredicate>),
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct InputConfigDetails {
    /// Extractor name; omitted (or rendered to the omit token) means
    /// auto-detect
    pub extractor: Option<String>,
    pub default_file: Option<String>,
    pub prepend_postings: Option<Vec<PostingTemplate>>,
    /// Deprecated spelling of `append_postings`, still honored
    pub appending_postings: Option<Vec<PostingTemplate>>,
    pub append_postings: Option<Vec<PostingTemplate>>,
    pub default_txn: Option<TransactionTemplate>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InputConfig {
    pub r#match: FileMatch,
    #[serde(default)]
    pub config: InputConfigDetails,
    pub filter: Option<InputFilter>,
    /// One rendered copy of this input is emitted per loop entry
    pub r#loop: Option<Vec<BTreeMap<String, serde_json::Value>>>,
}

/// Reserved; currently only declarative
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputConfig {
    pub r#match: FileMatch,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImportRule {
    /// For users to read only
    pub name: Option<String>,
    /// AND-combined with every condition of the match list
    pub common_cond: Option<TxnMatchRule>,
    pub r#match: RuleMatch,
    pub actions: Vec<Action>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IncludeRule {
    pub include: StringOrStrings,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StringOrStrings {
    Single(String),
    Many(Vec<String>),
}

impl StringOrStrings {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            StringOrStrings::Single(s) => std::slice::from_ref(s),
            StringOrStrings::Many(v) => v.as_slice(),
        }
        .iter()
        .map(String::as_str)
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RuleOrInclude {
    Include(IncludeRule),
    Rule(ImportRule),
}

/// The standalone rule-list document referenced by `include` entries
pub type ImportList = Vec<RuleOrInclude>;

/// Top-level import configuration document
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImportDoc {
    /// Merged into the template environment globals once per run
    pub context: Option<BTreeMap<String, serde_json::Value>>,
    pub inputs: Vec<InputConfig>,
    pub imports: ImportList,
    pub outputs: Option<Vec<OutputConfig>>,
}
