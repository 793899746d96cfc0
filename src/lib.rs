pub mod apply;
pub mod bean;
pub mod config;
pub mod extract;
pub mod inputs;
pub mod matching;
mod paths;
pub mod processor;
pub mod reconcile;
pub mod record;
pub mod template;
pub mod txn;

use anyhow::{anyhow, Context, Result};
use apply::{apply_change_set, synthesize_tree};
use bean::Tree;
use config::{includes::resolve_includes, ImportDoc};
use extract::ExtractorRegistry;
use inputs::expand_inputs;
use paths::normalize;
use processor::process_imports;
use reconcile::{compute_changes, extract_existing_transactions};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use template::TemplateRenderer;
use tracing::info;
use txn::{BeancountTransaction, GeneratedTransaction, UnprocessedTransaction};

/// One import run: load configuration, stream records through the rules,
/// reconcile against the existing ledger tree, and rewrite the target
/// files. Re-running over its own output is a no-op.
pub struct Importer {
    workdir_path: PathBuf,
    beanfile_path: PathBuf,
    config_path: PathBuf,
    remove_dangling: bool,
    registry: ExtractorRegistry,
}

/// What a run did, for reporting
#[derive(Debug, Default)]
pub struct RunReport {
    pub generated: Vec<GeneratedTransaction>,
    /// Existing entries removed because a rule deleted their id
    pub deleted: Vec<BeancountTransaction>,
    pub dangling: Vec<BeancountTransaction>,
    pub unprocessed: Vec<UnprocessedTransaction>,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize(path))
    } else {
        Ok(normalize(
            &std::env::current_dir()
                .context("Failed to resolve the current directory")?
                .join(path),
        ))
    }
}

impl Importer {
    pub fn new(
        workdir: &Path,
        beanfile: &Path,
        config: &Path,
        remove_dangling: bool,
    ) -> Result<Self> {
        let workdir_path = absolute(workdir)?;
        let beanfile_path = normalize(&workdir_path.join(beanfile));
        let config_path = normalize(&workdir_path.join(config));
        Ok(Importer {
            workdir_path,
            beanfile_path,
            config_path,
            remove_dangling,
            registry: ExtractorRegistry::builtin(),
        })
    }

    /// Replace the built-in extractor registry
    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn remove_dangling(&self) -> bool {
        self.remove_dangling
    }

    fn load_config(&self) -> Result<ImportDoc> {
        let contents = std::fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read import config {}", self.config_path.display())
        })?;
        let import_doc: ImportDoc = serde_yaml::from_str(&contents).with_context(|| {
            format!("Failed to parse import config {}", self.config_path.display())
        })?;
        info!("Loaded import doc from {}", self.config_path.display());
        Ok(import_doc)
    }

    pub async fn run(&self) -> Result<RunReport> {
        if !self.beanfile_path.starts_with(&self.workdir_path) {
            return Err(anyhow!(
                "The provided beanfile path {} is not a sub-path of workdir {}",
                self.beanfile_path.display(),
                self.workdir_path.display()
            ));
        }
        let import_doc = self.load_config()?;
        let renderer = TemplateRenderer::new(import_doc.context.as_ref());
        let import_rules = resolve_includes(&self.workdir_path, &import_doc.imports)?;
        let rendered_inputs = expand_inputs(&renderer, &import_doc.inputs)?;

        let collected = process_imports(
            &renderer,
            &rendered_inputs,
            &import_rules,
            &self.registry,
            &self.workdir_path,
        )
        .await?;
        info!("Generated {} transactions", collected.generated.len());
        info!("Deleted {} transactions", collected.deleted.len());
        info!("Skipped {} transactions", collected.unprocessed.len());

        info!("Collecting existing imported transactions from ledger files ...");
        let existing_txns = extract_existing_transactions(&self.beanfile_path)?;
        info!(
            "Found {} existing imported transactions in ledger files",
            existing_txns.len()
        );

        let change_sets = compute_changes(
            &collected.generated,
            &existing_txns,
            &self.workdir_path,
            &collected.deleted,
        );

        for (target_file, change_set) in &change_sets {
            let new_tree = if target_file.exists() {
                info!(
                    "Applying change sets (add={}, update={}, remove={}, dangling={}) with \
                     remove_dangling={} to {}",
                    change_set.add.len(),
                    change_set.update.len(),
                    change_set.remove.len(),
                    change_set.dangling.len(),
                    self.remove_dangling,
                    target_file.display()
                );
                let contents = async_std::fs::read_to_string(target_file)
                    .await
                    .with_context(|| {
                        format!("Failed to read ledger file {}", target_file.display())
                    })?;
                let tree: Tree = contents.parse().with_context(|| {
                    format!("Failed to parse ledger file {}", target_file.display())
                })?;
                apply_change_set(&tree, change_set, self.remove_dangling)?
            } else {
                info!(
                    "Create new bean file {} with {} transactions",
                    target_file.display(),
                    change_set.add.len()
                );
                synthesize_tree(change_set)?
            };
            if let Some(parent) = target_file.parent() {
                async_std::fs::create_dir_all(parent)
                    .await
                    .with_context(|| {
                        format!("Failed to create output directory {}", parent.display())
                    })?;
            }
            async_std::fs::write(target_file, new_tree.emit())
                .await
                .with_context(|| {
                    format!("Failed to write ledger file {}", target_file.display())
                })?;
        }
        info!("done");

        let deleted_ids: HashSet<&str> = collected
            .deleted
            .iter()
            .map(|txn| txn.id.as_str())
            .collect();
        let mut report = RunReport {
            generated: collected.generated,
            unprocessed: collected.unprocessed,
            ..RunReport::default()
        };
        for change_set in change_sets.values() {
            report.dangling.extend(change_set.dangling.iter().cloned());
            report.deleted.extend(
                change_set
                    .remove
                    .iter()
                    .filter(|txn| deleted_ids.contains(txn.id.as_str()))
                    .cloned(),
            );
        }
        Ok(report)
    }
}
