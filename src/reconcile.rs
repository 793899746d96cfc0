use crate::bean::{parse, Tree};
use crate::config::{IMPORT_ID_KEY, IMPORT_OVERRIDE_KEY};
use crate::paths::normalize;
use crate::txn::{
    BeancountTransaction, ChangeSet, DeletedTransaction, GeneratedTransaction, OverrideFlag,
    OverrideFlags, TransactionUpdate,
};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Parse the comma-separated `import-override` value. Unknown tokens, or
/// `none`/`all` mixed with other flags, leave the set unset with a warning.
pub fn parse_override_flags(value: &str) -> Option<OverrideFlags> {
    let mut flags = OverrideFlags::new();
    for part in value.split(',') {
        match part.trim().parse::<OverrideFlag>() {
            Ok(flag) => {
                flags.insert(flag);
            }
            Err(_) => {
                warn!("Invalid override flags: {value}");
                return None;
            }
        }
    }
    if (flags.contains(&OverrideFlag::None) || flags.contains(&OverrideFlag::All))
        && flags.len() > 1
    {
        warn!(
            "When none or all present in the override flags, there should be no other flags \
             but we got {value}"
        );
        return None;
    }
    Some(flags)
}

/// Walk the ledger tree from the main file, following `include` chains,
/// and collect every transaction carrying an `import-id`.
pub fn extract_existing_transactions(bean_file: &Path) -> Result<Vec<BeancountTransaction>> {
    let mut found = Vec::new();
    let mut visited = HashSet::new();
    traverse(bean_file, &mut visited, &mut found)?;
    Ok(found)
}

fn traverse(
    bean_file: &Path,
    visited: &mut HashSet<PathBuf>,
    found: &mut Vec<BeancountTransaction>,
) -> Result<()> {
    let bean_path = normalize(bean_file);
    if !visited.insert(bean_path.clone()) {
        return Ok(());
    }
    let content = std::fs::read_to_string(&bean_path)
        .with_context(|| format!("Failed to read ledger file {}", bean_path.display()))?;
    let tree: Tree = content
        .parse()
        .with_context(|| format!("Failed to parse ledger file {}", bean_path.display()))?;
    for entry in &tree.entries {
        if !entry.is_transaction() {
            continue;
        }
        let mut import_id = None;
        let mut import_override = None;
        for line in &entry.metadata {
            if let Some((key, value)) = parse::string_metadata(line) {
                if key == IMPORT_ID_KEY {
                    import_id = Some(value);
                } else if key == IMPORT_OVERRIDE_KEY {
                    import_override = parse_override_flags(&value);
                }
            }
        }
        if let Some(id) = import_id {
            found.push(BeancountTransaction {
                file: bean_path.clone(),
                lineno: entry.lineno,
                id,
                r#override: import_override,
            });
        }
    }
    let parent = bean_path.parent().unwrap_or_else(|| Path::new(""));
    for include in tree.includes() {
        traverse(&parent.join(include), visited, found)?;
    }
    Ok(())
}

/// Diff generated transactions against the existing set, keyed by import
/// id, into one change set per target file.
pub fn compute_changes(
    generated_txns: &[GeneratedTransaction],
    imported_txns: &[BeancountTransaction],
    work_dir: &Path,
    deleted_txns: &[DeletedTransaction],
) -> BTreeMap<PathBuf, ChangeSet> {
    let generated_id_txns: HashMap<&str, &GeneratedTransaction> = generated_txns
        .iter()
        .map(|txn| (txn.id.as_str(), txn))
        .collect();
    let imported_id_txns: HashMap<&str, &BeancountTransaction> = imported_txns
        .iter()
        .map(|txn| (txn.id.as_str(), txn))
        .collect();
    let deleted_txn_ids: HashSet<&str> =
        deleted_txns.iter().map(|txn| txn.id.as_str()).collect();

    let mut change_sets: BTreeMap<PathBuf, ChangeSet> = BTreeMap::new();

    for txn in imported_txns {
        let file = normalize(&txn.file);
        if deleted_txn_ids.contains(txn.id.as_str()) {
            change_sets.entry(file).or_default().remove.push(txn.clone());
            continue;
        }
        match generated_id_txns.get(txn.id.as_str()) {
            Some(generated) if file != normalize(&work_dir.join(&generated.file)) => {
                // the generated txn moved to another file, drop it here
                change_sets.entry(file).or_default().remove.push(txn.clone());
            }
            None if txn.r#override.is_none() => {
                change_sets
                    .entry(file)
                    .or_default()
                    .dangling
                    .push(txn.clone());
            }
            _ => {}
        }
    }

    for txn in generated_txns {
        if deleted_txn_ids.contains(txn.id.as_str()) {
            continue;
        }
        let generated_file = normalize(&work_dir.join(&txn.file));
        match imported_id_txns.get(txn.id.as_str()) {
            Some(imported) if normalize(&imported.file) == generated_file => {
                change_sets.entry(generated_file).or_default().update.insert(
                    imported.lineno,
                    TransactionUpdate {
                        txn: txn.clone(),
                        r#override: imported.r#override.clone(),
                    },
                );
            }
            _ => {
                change_sets
                    .entry(generated_file)
                    .or_default()
                    .add
                    .push(txn.clone());
            }
        }
    }

    change_sets
}

#[cfg(test)]
mod reconcile_tests {
    use super::*;
    use anyhow::Result;
    use indoc::indoc;

    fn generated(id: &str, file: &str) -> GeneratedTransaction {
        GeneratedTransaction {
            file: file.to_string(),
            id: id.to_string(),
            sources: vec!["mercury.csv".to_string()],
            date: "2024-04-16".to_string(),
            flag: "*".to_string(),
            narration: "Amazon Web Services".to_string(),
            payee: None,
            tags: Vec::new(),
            links: Vec::new(),
            metadata: Vec::new(),
            postings: Vec::new(),
        }
    }

    fn imported(id: &str, file: &str, lineno: usize) -> BeancountTransaction {
        BeancountTransaction {
            file: PathBuf::from(file),
            lineno,
            id: id.to_string(),
            r#override: None,
        }
    }

    #[test]
    fn override_flag_parsing() {
        assert_eq!(
            parse_override_flags("narration"),
            Some([OverrideFlag::Narration].into_iter().collect())
        );
        assert_eq!(
            parse_override_flags("narration,payee"),
            Some(
                [OverrideFlag::Narration, OverrideFlag::Payee]
                    .into_iter()
                    .collect()
            )
        );
        assert_eq!(parse_override_flags("none"), Some([OverrideFlag::None].into_iter().collect()));
        // unknown tokens and bad combinations leave the set unset
        assert_eq!(parse_override_flags("bogus"), None);
        assert_eq!(parse_override_flags("all,narration"), None);
        assert_eq!(parse_override_flags("none,payee"), None);
    }

    #[test]
    fn matched_ids_become_updates() {
        let change_sets = compute_changes(
            &[generated("id-1", "main.bean")],
            &[imported("id-1", "/work/main.bean", 7)],
            Path::new("/work"),
            &[],
        );
        let change_set = &change_sets[Path::new("/work/main.bean")];
        assert_eq!(change_set.update.len(), 1);
        assert_eq!(change_set.update[&7].txn.id, "id-1");
        assert!(change_set.add.is_empty());
        assert!(change_set.remove.is_empty());
        assert!(change_set.dangling.is_empty());
    }

    #[test]
    fn new_ids_become_adds() {
        let change_sets = compute_changes(
            &[generated("id-1", "main.bean")],
            &[],
            Path::new("/work"),
            &[],
        );
        let change_set = &change_sets[Path::new("/work/main.bean")];
        assert_eq!(change_set.add.len(), 1);
        assert!(change_set.update.is_empty());
    }

    #[test]
    fn unmatched_existing_without_override_is_dangling() {
        let change_sets =
            compute_changes(&[], &[imported("X", "/work/main.bean", 3)], Path::new("/work"), &[]);
        let change_set = &change_sets[Path::new("/work/main.bean")];
        assert_eq!(change_set.dangling.len(), 1);
        assert!(change_set.remove.is_empty());
    }

    #[test]
    fn override_flag_shields_from_dangling() {
        let mut existing = imported("X", "/work/main.bean", 3);
        existing.r#override = Some([OverrideFlag::None].into_iter().collect());
        let change_sets = compute_changes(&[], &[existing], Path::new("/work"), &[]);
        assert!(change_sets.is_empty());
    }

    #[test]
    fn deleted_id_wins_over_generated() {
        let deleted = vec![DeletedTransaction {
            id: "id-1".to_string(),
        }];
        let change_sets = compute_changes(
            &[generated("id-1", "main.bean")],
            &[imported("id-1", "/work/main.bean", 7)],
            Path::new("/work"),
            &deleted,
        );
        let change_set = &change_sets[Path::new("/work/main.bean")];
        assert_eq!(change_set.remove.len(), 1);
        assert!(change_set.update.is_empty());
        assert!(change_set.add.is_empty());
    }

    #[test]
    fn moved_id_removes_old_and_adds_new() {
        let change_sets = compute_changes(
            &[generated("id-1", "books/2024.bean")],
            &[imported("id-1", "/work/main.bean", 7)],
            Path::new("/work"),
            &[],
        );
        let old = &change_sets[Path::new("/work/main.bean")];
        assert_eq!(old.remove.len(), 1);
        let new = &change_sets[Path::new("/work/books/2024.bean")];
        assert_eq!(new.add.len(), 1);
    }

    #[test]
    fn scanner_follows_includes() -> Result<()> {
        let workdir = tempfile::tempdir()?;
        std::fs::create_dir(workdir.path().join("books"))?;
        std::fs::write(
            workdir.path().join("main.bean"),
            indoc! {r#"
                option "title" "Books"
                include "books/2024.bean"

                2024-04-16 * "Amazon Web Services"
                  import-id: "mercury.csv:-3"
                  Assets:Bank:US:Mercury -353.63 USD
            "#},
        )?;
        std::fs::write(
            workdir.path().join("books/2024.bean"),
            indoc! {r#"
                2024-04-17 * "GitHub"
                  import-id: "mercury.csv:-2"
                  import-override: "narration,payee"

                2024-04-18 * "no import id here"
            "#},
        )?;
        let mut existing = extract_existing_transactions(&workdir.path().join("main.bean"))?;
        existing.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[0].id, "mercury.csv:-2");
        assert_eq!(
            existing[0].r#override,
            Some(
                [OverrideFlag::Narration, OverrideFlag::Payee]
                    .into_iter()
                    .collect()
            )
        );
        assert_eq!(existing[1].id, "mercury.csv:-3");
        assert_eq!(existing[1].lineno, 4);
        assert_eq!(existing[1].r#override, None);
        Ok(())
    }
}
