use crate::bean::{
    format_txn_header, quote, Entry, StatementKind, Tree, TxnHeader, ADD_ENTRY_LINENO_OFFSET,
};
use crate::config::{IMPORT_ID_KEY, IMPORT_SRC_KEY};
use crate::txn::{ChangeSet, GeneratedPosting, GeneratedTransaction, OverrideFlag, TransactionUpdate};
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;

pub fn posting_to_text(posting: &GeneratedPosting) -> String {
    let mut columns = vec![posting.account.clone()];
    if let Some(amount) = &posting.amount {
        columns.push(format!("{} {}", amount.number, amount.currency));
    }
    if let Some(cost) = &posting.cost {
        columns.push(cost.clone());
    }
    if let Some(price) = &posting.price {
        columns.push(format!("@ {} {}", price.number, price.currency));
    }
    format!("  {}", columns.join(" "))
}

/// Render a generated transaction in ledger syntax
pub fn txn_to_text(txn: &GeneratedTransaction) -> Result<String> {
    let entry = entry_from_generated(txn, 0)?;
    let mut lines = vec![entry.statement];
    lines.extend(entry.metadata);
    lines.extend(entry.postings);
    Ok(lines.join("\n"))
}

fn header_from_generated(txn: &GeneratedTransaction) -> Result<TxnHeader> {
    Ok(TxnHeader {
        date: txn
            .date
            .parse()
            .with_context(|| format!("Transaction {} has invalid date '{}'", txn.id, txn.date))?,
        flag: txn.flag.clone(),
        payee: txn.payee.clone(),
        narration: txn.narration.clone(),
        hashtags: txn.tags.clone(),
        links: txn.links.clone(),
    })
}

/// Build a syntax-tree entry for a generated transaction, placed at the
/// given artificial line number.
pub fn entry_from_generated(txn: &GeneratedTransaction, lineno: usize) -> Result<Entry> {
    let header = header_from_generated(txn)?;
    let mut metadata = vec![format!("  {}: {}", IMPORT_ID_KEY, quote(&txn.id))];
    if !txn.sources.is_empty() {
        metadata.push(format!(
            "  {}: {}",
            IMPORT_SRC_KEY,
            quote(&txn.sources.join(":"))
        ));
    }
    for item in &txn.metadata {
        metadata.push(format!("  {}: {}", item.name, quote(&item.value)));
    }
    Ok(Entry {
        comments: Vec::new(),
        lineno,
        statement: format_txn_header(&header),
        kind: StatementKind::Transaction(header),
        metadata,
        postings: txn.postings.iter().map(posting_to_text).collect(),
    })
}

/// Compute the replacement for an existing entry under the override
/// discipline: an unset or `all` flag set takes the generated entry
/// wholesale, `none` keeps the existing one, and a partial set replaces
/// exactly the flagged attributes.
fn update_transaction(entry: &Entry, update: &TransactionUpdate, lineno: usize) -> Result<Entry> {
    let new_entry = entry_from_generated(&update.txn, lineno)?;
    let Some(overrides) = &update.r#override else {
        return Ok(new_entry);
    };
    if overrides.contains(&OverrideFlag::All) {
        return Ok(new_entry);
    }
    if overrides.contains(&OverrideFlag::None) {
        return Ok(entry.clone());
    }
    let StatementKind::Transaction(existing_header) = &entry.kind else {
        return Err(anyhow!(
            "Expected a transaction at line {}, found another directive",
            entry.lineno
        ));
    };
    // partial merges compare annotations in sorted form; parsed headers
    // already carry theirs sorted
    let mut new_header = header_from_generated(&update.txn)?;
    new_header.hashtags.sort();
    new_header.links.sort();
    let mut result = entry.clone();
    let header_flags = [
        OverrideFlag::Date,
        OverrideFlag::Flag,
        OverrideFlag::Payee,
        OverrideFlag::Narration,
        OverrideFlag::Hashtags,
        OverrideFlag::Links,
    ];
    if header_flags.iter().any(|flag| overrides.contains(flag)) {
        let pick = |flag: OverrideFlag| overrides.contains(&flag);
        let merged = TxnHeader {
            date: if pick(OverrideFlag::Date) {
                new_header.date
            } else {
                existing_header.date
            },
            flag: if pick(OverrideFlag::Flag) {
                new_header.flag.clone()
            } else {
                existing_header.flag.clone()
            },
            payee: if pick(OverrideFlag::Payee) {
                new_header.payee.clone()
            } else {
                existing_header.payee.clone()
            },
            narration: if pick(OverrideFlag::Narration) {
                new_header.narration.clone()
            } else {
                existing_header.narration.clone()
            },
            hashtags: if pick(OverrideFlag::Hashtags) {
                new_header.hashtags.clone()
            } else {
                existing_header.hashtags.clone()
            },
            links: if pick(OverrideFlag::Links) {
                new_header.links.clone()
            } else {
                existing_header.links.clone()
            },
        };
        result.statement = format_txn_header(&merged);
        result.kind = StatementKind::Transaction(merged);
    }
    if overrides.contains(&OverrideFlag::Postings) {
        result.postings = new_entry.postings;
    }
    Ok(result)
}

/// Rewrite one parsed ledger tree, honoring the change set's removes,
/// updates and adds. Leading comments of kept entries and trailing
/// comments of the tree are preserved; removed entries take their
/// comments with them.
pub fn apply_change_set(
    tree: &Tree,
    change_set: &ChangeSet,
    remove_dangling: bool,
) -> Result<Tree> {
    let mut lines_to_remove: HashSet<usize> =
        change_set.remove.iter().map(|txn| txn.lineno).collect();
    if remove_dangling {
        lines_to_remove.extend(change_set.dangling.iter().map(|txn| txn.lineno));
    }

    let mut new_tree = Tree {
        entries: Vec::new(),
        tail_comments: tree.tail_comments.clone(),
    };
    for entry in &tree.entries {
        if lines_to_remove.contains(&entry.lineno) {
            continue;
        }
        match change_set.update.get(&entry.lineno) {
            Some(update) => {
                let mut replaced = update_transaction(entry, update, entry.lineno)?;
                // keep the existing entry's leading comments regardless
                replaced.comments = entry.comments.clone();
                new_tree.entries.push(replaced);
            }
            None => new_tree.entries.push(entry.clone()),
        }
    }
    for (index, txn) in change_set.add.iter().enumerate() {
        new_tree
            .entries
            .push(entry_from_generated(txn, ADD_ENTRY_LINENO_OFFSET + index)?);
    }
    Ok(new_tree)
}

/// Tree for a target file that does not exist yet; such change sets may
/// carry additions only.
pub fn synthesize_tree(change_set: &ChangeSet) -> Result<Tree> {
    if !change_set.remove.is_empty() || !change_set.update.is_empty() {
        return Err(anyhow!("Expect new transactions to add only"));
    }
    let mut tree = Tree::default();
    for (index, txn) in change_set.add.iter().enumerate() {
        tree.entries
            .push(entry_from_generated(txn, ADD_ENTRY_LINENO_OFFSET + index)?);
    }
    Ok(tree)
}

#[cfg(test)]
mod apply_tests {
    use super::*;
    use crate::txn::{Amount, BeancountTransaction, MetadataItem};
    use anyhow::Result;
    use indoc::indoc;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn generated(id: &str, narration: &str) -> GeneratedTransaction {
        GeneratedTransaction {
            file: "main.bean".to_string(),
            id: id.to_string(),
            sources: vec!["mercury.csv".to_string()],
            date: "2024-04-16".to_string(),
            flag: "*".to_string(),
            narration: narration.to_string(),
            payee: None,
            tags: Vec::new(),
            links: Vec::new(),
            metadata: Vec::new(),
            postings: vec![
                GeneratedPosting {
                    account: "Assets:Bank:US:Mercury".to_string(),
                    amount: Some(Amount {
                        number: "-353.63".to_string(),
                        currency: "USD".to_string(),
                    }),
                    price: None,
                    cost: None,
                },
                GeneratedPosting {
                    account: "Expenses:FooBar".to_string(),
                    amount: Some(Amount {
                        number: "353.63".to_string(),
                        currency: "USD".to_string(),
                    }),
                    price: None,
                    cost: None,
                },
            ],
        }
    }

    fn existing(id: &str, lineno: usize, flags: Option<&[OverrideFlag]>) -> BeancountTransaction {
        BeancountTransaction {
            file: PathBuf::from("main.bean"),
            lineno,
            id: id.to_string(),
            r#override: flags.map(|flags| flags.iter().copied().collect()),
        }
    }

    const EXISTING_BOOK: &str = indoc! {r#"
        ; keep this comment
        2024-04-16 * "Mock Payee" "MOCK_NARRATION" #tag-a ^link-a
          import-id: "MOCK_IMPORT_ID"
          Assets:Cash -100.00 USD
          Expenses:Old 100.00 USD
    "#};

    #[test]
    fn txn_text_layout() -> Result<()> {
        let mut txn = generated("mercury.csv:-3", "Amazon Web Services");
        txn.payee = Some("Amazon".to_string());
        txn.tags = vec!["cloud".to_string()];
        txn.links = vec!["invoice-1".to_string()];
        txn.metadata = vec![MetadataItem {
            name: "note".to_string(),
            value: "hosting".to_string(),
        }];
        assert_eq!(
            txn_to_text(&txn)?,
            indoc! {r#"
                2024-04-16 * "Amazon" "Amazon Web Services" #cloud ^invoice-1
                  import-id: "mercury.csv:-3"
                  import-src: "mercury.csv"
                  note: "hosting"
                  Assets:Bank:US:Mercury -353.63 USD
                  Expenses:FooBar 353.63 USD"#}
        );
        Ok(())
    }

    #[test]
    fn added_entry_keeps_declared_tag_and_link_order() -> Result<()> {
        let mut txn = generated("mercury.csv:-3", "Amazon Web Services");
        txn.tags = vec!["zebra".to_string(), "alpha".to_string()];
        txn.links = vec!["b-link".to_string(), "a-link".to_string()];
        assert!(txn_to_text(&txn)?.starts_with(
            r#"2024-04-16 * "Amazon Web Services" #zebra #alpha ^b-link ^a-link"#
        ));
        let tree: Tree = EXISTING_BOOK.parse()?;
        let change_set = ChangeSet {
            add: vec![txn],
            ..ChangeSet::default()
        };
        let emitted = apply_change_set(&tree, &change_set, false)?.emit();
        assert!(emitted.contains("#zebra #alpha ^b-link ^a-link"));
        Ok(())
    }

    #[test]
    fn posting_with_price_and_cost() {
        let posting = GeneratedPosting {
            account: "Assets:Crypto".to_string(),
            amount: Some(Amount {
                number: "0.5".to_string(),
                currency: "BTC".to_string(),
            }),
            price: Some(Amount {
                number: "62000".to_string(),
                currency: "USD".to_string(),
            }),
            cost: Some("{60000 USD}".to_string()),
        };
        assert_eq!(
            posting_to_text(&posting),
            "  Assets:Crypto 0.5 BTC {60000 USD} @ 62000 USD"
        );
    }

    #[test]
    fn update_with_narration_override_keeps_the_rest() -> Result<()> {
        let tree: Tree = EXISTING_BOOK.parse()?;
        let mut update = BTreeMap::new();
        update.insert(
            2,
            TransactionUpdate {
                txn: generated("MOCK_IMPORT_ID", "NEW_DESC"),
                r#override: Some([OverrideFlag::Narration].into_iter().collect()),
            },
        );
        let change_set = ChangeSet {
            update,
            ..ChangeSet::default()
        };
        let new_tree = apply_change_set(&tree, &change_set, false)?;
        let emitted = new_tree.emit();
        assert_eq!(
            emitted,
            indoc! {r#"
                ; keep this comment
                2024-04-16 * "Mock Payee" "NEW_DESC" #tag-a ^link-a
                  import-id: "MOCK_IMPORT_ID"
                  Assets:Cash -100.00 USD
                  Expenses:Old 100.00 USD
            "#}
        );
        Ok(())
    }

    #[test]
    fn update_with_unset_override_replaces_fully() -> Result<()> {
        let tree: Tree = EXISTING_BOOK.parse()?;
        let mut update = BTreeMap::new();
        update.insert(
            2,
            TransactionUpdate {
                txn: generated("MOCK_IMPORT_ID", "NEW_DESC"),
                r#override: None,
            },
        );
        let change_set = ChangeSet {
            update,
            ..ChangeSet::default()
        };
        let new_tree = apply_change_set(&tree, &change_set, false)?;
        let emitted = new_tree.emit();
        assert!(emitted.contains("; keep this comment"));
        assert!(emitted.contains(r#"2024-04-16 * "NEW_DESC""#));
        assert!(emitted.contains("Expenses:FooBar 353.63 USD"));
        assert!(!emitted.contains("Mock Payee"));
        Ok(())
    }

    #[test]
    fn update_with_none_override_changes_nothing() -> Result<()> {
        let tree: Tree = EXISTING_BOOK.parse()?;
        let mut update = BTreeMap::new();
        update.insert(
            2,
            TransactionUpdate {
                txn: generated("MOCK_IMPORT_ID", "NEW_DESC"),
                r#override: Some([OverrideFlag::None].into_iter().collect()),
            },
        );
        let change_set = ChangeSet {
            update,
            ..ChangeSet::default()
        };
        let new_tree = apply_change_set(&tree, &change_set, false)?;
        assert_eq!(new_tree.emit(), EXISTING_BOOK);
        Ok(())
    }

    #[test]
    fn update_with_postings_override_replaces_postings_only() -> Result<()> {
        let tree: Tree = EXISTING_BOOK.parse()?;
        let mut update = BTreeMap::new();
        update.insert(
            2,
            TransactionUpdate {
                txn: generated("MOCK_IMPORT_ID", "NEW_DESC"),
                r#override: Some([OverrideFlag::Postings].into_iter().collect()),
            },
        );
        let change_set = ChangeSet {
            update,
            ..ChangeSet::default()
        };
        let emitted = apply_change_set(&tree, &change_set, false)?.emit();
        assert!(emitted.contains("MOCK_NARRATION"));
        assert!(emitted.contains("Expenses:FooBar 353.63 USD"));
        assert!(!emitted.contains("Expenses:Old"));
        Ok(())
    }

    #[test]
    fn dangling_stays_unless_remove_dangling() -> Result<()> {
        let tree: Tree = EXISTING_BOOK.parse()?;
        let change_set = ChangeSet {
            dangling: vec![existing("MOCK_IMPORT_ID", 2, None)],
            ..ChangeSet::default()
        };
        let kept = apply_change_set(&tree, &change_set, false)?;
        assert_eq!(kept.emit(), EXISTING_BOOK);
        let removed = apply_change_set(&tree, &change_set, true)?;
        assert_eq!(removed.emit(), "");
        Ok(())
    }

    #[test]
    fn removal_drops_attached_comments() -> Result<()> {
        let tree: Tree = EXISTING_BOOK.parse()?;
        let change_set = ChangeSet {
            remove: vec![existing("MOCK_IMPORT_ID", 2, None)],
            ..ChangeSet::default()
        };
        let emitted = apply_change_set(&tree, &change_set, false)?.emit();
        assert_eq!(emitted, "");
        Ok(())
    }

    #[test]
    fn additions_sort_after_existing_same_date_entries() -> Result<()> {
        let tree: Tree = EXISTING_BOOK.parse()?;
        let change_set = ChangeSet {
            add: vec![generated("mercury.csv:-3", "Amazon Web Services")],
            ..ChangeSet::default()
        };
        let emitted = apply_change_set(&tree, &change_set, false)?.emit();
        let mock = emitted.find("MOCK_NARRATION").unwrap();
        let added = emitted.find("Amazon Web Services").unwrap();
        assert!(mock < added);
        Ok(())
    }

    #[test]
    fn synthesized_tree_rejects_updates() {
        let mut update = BTreeMap::new();
        update.insert(
            2,
            TransactionUpdate {
                txn: generated("x", "y"),
                r#override: None,
            },
        );
        let change_set = ChangeSet {
            update,
            ..ChangeSet::default()
        };
        assert!(synthesize_tree(&change_set).is_err());
    }
}
