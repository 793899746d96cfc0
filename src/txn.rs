use crate::record::Record;
use anyhow::{anyhow, Error};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Rendered amount of a posting, already in display form
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Amount {
    pub number: String,
    pub currency: String,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GeneratedPosting {
    pub account: String,
    pub amount: Option<Amount>,
    pub price: Option<Amount>,
    pub cost: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MetadataItem {
    pub name: String,
    pub value: String,
}

/// A fully rendered ledger entry produced from a record via a rule
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GeneratedTransaction {
    /// Output file, relative to the working directory
    pub file: String,
    /// The `import-id` metadata value used for de-duplication
    pub id: String,
    /// Source files recorded as `import-src`; never line numbers, so that
    /// re-ordered source rows do not destabilize existing annotations
    pub sources: Vec<String>,
    pub date: String,
    pub flag: String,
    pub narration: String,
    pub payee: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<String>,
    pub metadata: Vec<MetadataItem>,
    pub postings: Vec<GeneratedPosting>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DeletedTransaction {
    pub id: String,
}

/// A record no add/delete rule claimed, kept for reporting
#[derive(Debug, PartialEq, Clone)]
pub struct UnprocessedTransaction {
    pub import_id: String,
    pub txn: Record,
    pub output_file: Option<String>,
    pub prepending_postings: Option<Vec<GeneratedPosting>>,
    pub appending_postings: Option<Vec<GeneratedPosting>>,
}

/// Fields of an existing entry immune to (or selected for) replacement
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum OverrideFlag {
    None,
    All,
    Date,
    Flag,
    Narration,
    Payee,
    Hashtags,
    Links,
    Postings,
}

pub type OverrideFlags = BTreeSet<OverrideFlag>;

impl FromStr for OverrideFlag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(OverrideFlag::None),
            "all" => Ok(OverrideFlag::All),
            "date" => Ok(OverrideFlag::Date),
            "flag" => Ok(OverrideFlag::Flag),
            "narration" => Ok(OverrideFlag::Narration),
            "payee" => Ok(OverrideFlag::Payee),
            "hashtags" => Ok(OverrideFlag::Hashtags),
            "links" => Ok(OverrideFlag::Links),
            "postings" => Ok(OverrideFlag::Postings),
            _ => Err(anyhow!("Unknown override flag '{}'", s)),
        }
    }
}

impl fmt::Display for OverrideFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OverrideFlag::None => "none",
            OverrideFlag::All => "all",
            OverrideFlag::Date => "date",
            OverrideFlag::Flag => "flag",
            OverrideFlag::Narration => "narration",
            OverrideFlag::Payee => "payee",
            OverrideFlag::Hashtags => "hashtags",
            OverrideFlag::Links => "links",
            OverrideFlag::Postings => "postings",
        };
        f.write_str(name)
    }
}

/// Reference to an existing imported entry in the ledger files
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BeancountTransaction {
    pub file: PathBuf,
    /// 1-based line of the transaction header
    pub lineno: usize,
    pub id: String,
    pub r#override: Option<OverrideFlags>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TransactionUpdate {
    pub txn: GeneratedTransaction,
    pub r#override: Option<OverrideFlags>,
}

/// The per-file quadruple of mutations to apply
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ChangeSet {
    pub remove: Vec<BeancountTransaction>,
    pub update: BTreeMap<usize, TransactionUpdate>,
    pub add: Vec<GeneratedTransaction>,
    pub dangling: Vec<BeancountTransaction>,
}
