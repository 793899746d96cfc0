use crate::config::{
    Action, ImportRule, InputConfigDetails, PostingTemplate, RuleMatch, TransactionTemplate,
    IMPORT_ID_KEY, IMPORT_SRC_KEY,
};
use crate::extract::{ExtractorRegistry, SourceFile};
use crate::inputs::{record_passes_filter, LoopVars, RenderedInput};
use crate::matching::{match_file, match_transaction, match_transaction_with_vars};
use crate::paths::stays_inside;
use crate::record::Record;
use crate::template::{TemplateContext, TemplateRenderer};
use crate::txn::{
    Amount, DeletedTransaction, GeneratedPosting, GeneratedTransaction, MetadataItem,
    UnprocessedTransaction,
};
use anyhow::{anyhow, Context, Result};
use async_walkdir::WalkDir;
use futures::stream::TryStreamExt;
use minijinja::value::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Built-in fallbacks at the bottom of the template priority chain
pub const DEFAULT_TXN_ID: &str = "{{ file | as_posix_path }}:{{ lineno }}";
pub const DEFAULT_TXN_DATE: &str = "{{ date }}";
pub const DEFAULT_TXN_FLAG: &str = "*";
pub const DEFAULT_TXN_NARRATION: &str = "{{ desc | default(bank_desc, true) }}";

/// Emission from one record's matching rule
#[derive(Debug, PartialEq, Clone)]
pub enum Output {
    Generated(GeneratedTransaction),
    Deleted(DeletedTransaction),
}

/// What one record produced: the emitted outputs plus, when no add or
/// delete rule claimed the record, the unprocessed report entry.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ProcessResult {
    pub outputs: Vec<Output>,
    pub unprocessed: Option<UnprocessedTransaction>,
}

fn first_non_none<'a>(values: &[Option<&'a str>]) -> Option<&'a str> {
    values.iter().copied().flatten().next()
}

fn render_txn_id(
    renderer: &TemplateRenderer,
    template: &str,
    ctx: &TemplateContext,
) -> Result<String> {
    renderer
        .render(template, ctx)?
        .filter(|rendered| !rendered.is_empty())
        .with_context(|| format!("Transaction id is empty after rendering '{template}'"))
}

fn render_amount(
    renderer: &TemplateRenderer,
    template: &crate::config::AmountTemplate,
    ctx: &TemplateContext,
) -> Result<Amount> {
    Ok(Amount {
        number: renderer
            .render_optional(template.number.as_deref(), ctx)?
            .context("Posting amount number rendered to nothing")?,
        currency: renderer
            .render_optional(template.currency.as_deref(), ctx)?
            .context("Posting amount currency rendered to nothing")?,
    })
}

fn generate_postings<'a, I>(
    renderer: &TemplateRenderer,
    templates: I,
    ctx: &TemplateContext,
) -> Result<Vec<GeneratedPosting>>
where
    I: IntoIterator<Item = &'a PostingTemplate>,
{
    templates
        .into_iter()
        .map(|template| {
            Ok(GeneratedPosting {
                account: renderer
                    .render_optional(template.account.as_deref(), ctx)?
                    .context("Posting account rendered to nothing")?,
                amount: template
                    .amount
                    .as_ref()
                    .map(|amount| render_amount(renderer, amount, ctx))
                    .transpose()?,
                price: template
                    .price
                    .as_ref()
                    .map(|price| render_amount(renderer, price, ctx))
                    .transpose()?,
                cost: renderer.render_optional(template.cost.as_deref(), ctx)?,
            })
        })
        .collect()
}

fn render_tags_or_links(
    renderer: &TemplateRenderer,
    items: Option<&Vec<String>>,
    ctx: &TemplateContext,
) -> Result<Vec<String>> {
    let mut rendered = Vec::new();
    for item in items.into_iter().flatten() {
        if let Some(value) = renderer.render(item, ctx)? {
            if !value.is_empty() {
                rendered.push(value);
            }
        }
    }
    Ok(rendered)
}

/// Compose the posting templates for an add action: input-level prepends,
/// then the action's (or default transaction's) postings, then appends.
/// The deprecated `appending_postings` spelling is honored with a warning
/// when `append_postings` is absent.
fn compose_posting_templates<'a>(
    input_config: &'a InputConfigDetails,
    action_postings: Option<&'a Vec<PostingTemplate>>,
) -> Vec<&'a PostingTemplate> {
    let mut templates: Vec<&PostingTemplate> = Vec::new();
    if let Some(prepend) = &input_config.prepend_postings {
        templates.extend(prepend);
    }
    match action_postings {
        Some(postings) => templates.extend(postings),
        None => {
            if let Some(default_txn) = &input_config.default_txn {
                if let Some(postings) = &default_txn.postings {
                    templates.extend(postings);
                }
            }
        }
    }
    match (&input_config.append_postings, &input_config.appending_postings) {
        (Some(append), _) => templates.extend(append),
        (None, Some(appending)) => {
            warn!(
                "The \"appending_postings\" field is deprecated, please use \
                 \"append_postings\" instead"
            );
            templates.extend(appending);
        }
        (None, None) => {}
    }
    templates
}

fn render_metadata(
    renderer: &TemplateRenderer,
    templates: &[crate::config::MetadataItemTemplate],
    ctx: &TemplateContext,
) -> Result<Vec<MetadataItem>> {
    let mut metadata = Vec::new();
    for template in templates {
        let name = renderer.render(&template.name, ctx)?.unwrap_or_default();
        let value = renderer.render(&template.value, ctx)?.unwrap_or_default();
        if name.is_empty() || value.is_empty() {
            continue;
        }
        if name == IMPORT_ID_KEY || name == IMPORT_SRC_KEY {
            return Err(anyhow!(
                "Metadata item name {name} is reserved for importer usage"
            ));
        }
        metadata.push(MetadataItem { name, value });
    }
    Ok(metadata)
}

/// Run one record through the rule list. The first rule whose match (and
/// common condition, in the list form) passes owns the record; its actions
/// drive what gets emitted.
pub fn process_transaction(
    renderer: &TemplateRenderer,
    input_config: &InputConfigDetails,
    import_rules: &[ImportRule],
    record: &Record,
    loop_vars: Option<&LoopVars>,
    default_import_id: Option<&str>,
) -> Result<ProcessResult> {
    let mut base_ctx = renderer.record_context(record)?;
    if let Some(loop_vars) = loop_vars {
        for (name, value) in loop_vars {
            base_ctx.insert(name.clone(), Value::from_serialize(value));
        }
    }
    let default_txn = input_config.default_txn.as_ref();
    let mut outputs = Vec::new();
    let mut processed = false;

    for import_rule in import_rules {
        let ctx = match &import_rule.r#match {
            RuleMatch::Single(cond) => {
                if !match_transaction(record, cond)? {
                    continue;
                }
                base_ctx.clone()
            }
            RuleMatch::Multi(subrules) => {
                let Some(subrule) = match_transaction_with_vars(
                    record,
                    subrules,
                    import_rule.common_cond.as_ref(),
                )?
                else {
                    continue;
                };
                let mut ctx = base_ctx.clone();
                for (name, value) in subrule.vars.iter().flatten() {
                    let bound = match value {
                        serde_json::Value::String(template) => renderer
                            .render(template, &base_ctx)?
                            .map(Value::from)
                            .unwrap_or(Value::UNDEFINED),
                        other => Value::from_serialize(other),
                    };
                    ctx.insert(name.clone(), bound);
                }
                ctx
            }
        };

        for action in &import_rule.actions {
            match action {
                Action::Ignore => {
                    debug!("Ignored record {:?}:{:?}", record.file, record.lineno);
                    return Ok(ProcessResult {
                        outputs,
                        unprocessed: None,
                    });
                }
                Action::DelTxn { txn } => {
                    let id_template = first_non_none(&[
                        txn.id.as_deref(),
                        default_txn.and_then(|txn| txn.id.as_deref()),
                        default_import_id,
                        Some(DEFAULT_TXN_ID),
                    ])
                    .unwrap_or(DEFAULT_TXN_ID);
                    outputs.push(Output::Deleted(DeletedTransaction {
                        id: render_txn_id(renderer, id_template, &ctx)?,
                    }));
                    processed = true;
                }
                Action::AddTxn { file, txn } => {
                    let generated =
                        generate_transaction(renderer, input_config, file.as_deref(), txn, record, &ctx, default_import_id)?;
                    outputs.push(Output::Generated(generated));
                    processed = true;
                }
            }
        }
        // the first matching rule owns the record
        break;
    }

    if processed {
        return Ok(ProcessResult {
            outputs,
            unprocessed: None,
        });
    }

    debug!(
        "No match found for record at {:?}:{:?}",
        record.file, record.lineno
    );
    let id_template = first_non_none(&[
        default_txn.and_then(|txn| txn.id.as_deref()),
        default_import_id,
        Some(DEFAULT_TXN_ID),
    ])
    .unwrap_or(DEFAULT_TXN_ID);
    let import_id = render_txn_id(renderer, id_template, &base_ctx)?;
    let prepending_postings = input_config
        .prepend_postings
        .as_ref()
        .map(|templates| generate_postings(renderer, templates, &base_ctx))
        .transpose()?;
    let appending_postings = input_config
        .append_postings
        .as_ref()
        .map(|templates| generate_postings(renderer, templates, &base_ctx))
        .transpose()?;
    Ok(ProcessResult {
        outputs,
        unprocessed: Some(UnprocessedTransaction {
            import_id,
            txn: record.clone(),
            output_file: renderer
                .render_optional(input_config.default_file.as_deref(), &base_ctx)?,
            prepending_postings,
            appending_postings,
        }),
    })
}

fn generate_transaction(
    renderer: &TemplateRenderer,
    input_config: &InputConfigDetails,
    action_file: Option<&str>,
    txn: &TransactionTemplate,
    record: &Record,
    ctx: &TemplateContext,
    default_import_id: Option<&str>,
) -> Result<GeneratedTransaction> {
    let default_txn = input_config.default_txn.as_ref();
    let pick = |action_value: Option<&str>,
                default_value: Option<&str>,
                built_in: Option<&str>|
     -> Option<String> {
        first_non_none(&[action_value, default_value, built_in]).map(str::to_string)
    };

    let id_template = first_non_none(&[
        txn.id.as_deref(),
        default_txn.and_then(|txn| txn.id.as_deref()),
        default_import_id,
        Some(DEFAULT_TXN_ID),
    ])
    .unwrap_or(DEFAULT_TXN_ID)
    .to_string();
    let id = render_txn_id(renderer, &id_template, ctx)?;

    let date_template = pick(
        txn.date.as_deref(),
        default_txn.and_then(|t| t.date.as_deref()),
        Some(DEFAULT_TXN_DATE),
    );
    let flag_template = pick(
        txn.flag.as_deref(),
        default_txn.and_then(|t| t.flag.as_deref()),
        Some(DEFAULT_TXN_FLAG),
    );
    let narration_template = pick(
        txn.narration.as_deref(),
        default_txn.and_then(|t| t.narration.as_deref()),
        Some(DEFAULT_TXN_NARRATION),
    );
    let payee_template = pick(
        txn.payee.as_deref(),
        default_txn.and_then(|t| t.payee.as_deref()),
        None,
    );

    let date = renderer
        .render_optional(date_template.as_deref(), ctx)?
        .with_context(|| format!("Transaction {id} date rendered to nothing"))?;
    let flag = renderer
        .render_optional(flag_template.as_deref(), ctx)?
        .with_context(|| format!("Transaction {id} flag rendered to nothing"))?;
    let narration = renderer
        .render_optional(narration_template.as_deref(), ctx)?
        .with_context(|| format!("Transaction {id} narration rendered to nothing"))?;
    let payee = renderer.render_optional(payee_template.as_deref(), ctx)?;

    let posting_templates = compose_posting_templates(input_config, txn.postings.as_ref());
    let postings = generate_postings(renderer, posting_templates, ctx)?;

    let tags = render_tags_or_links(renderer, txn.tags.as_ref(), ctx)?;
    let links = render_tags_or_links(renderer, txn.links.as_ref(), ctx)?;
    let metadata = match &txn.metadata {
        Some(templates) => render_metadata(renderer, templates, ctx)?,
        None => Vec::new(),
    };

    let output_file_template = first_non_none(&[action_file, input_config.default_file.as_deref()])
        .with_context(|| format!("Output file not defined when generating transaction {id}"))?;
    let file = renderer
        .render(output_file_template, ctx)?
        .unwrap_or_default();

    let sources = record.file.iter().cloned().collect();

    Ok(GeneratedTransaction {
        // no line number in sources; a CSV re-ordered by later rows must
        // not destabilize existing import-src annotations
        file,
        id,
        sources,
        date,
        flag,
        narration,
        payee,
        tags,
        links,
        metadata,
        postings,
    })
}

/// Everything one run's record streams produced, collected eagerly
#[derive(Debug, Default)]
pub struct ProcessedTransactions {
    pub generated: Vec<GeneratedTransaction>,
    pub deleted: Vec<DeletedTransaction>,
    pub unprocessed: Vec<UnprocessedTransaction>,
}

fn to_rel_posix(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk the working directory, stream each matching file's records through
/// the rule list, and collect the emissions. Files are visited in sorted
/// order so runs are deterministic.
pub async fn process_imports(
    renderer: &TemplateRenderer,
    inputs: &[RenderedInput],
    import_rules: &[ImportRule],
    registry: &ExtractorRegistry,
    input_dir: &Path,
) -> Result<ProcessedTransactions> {
    let mut filepaths: Vec<std::path::PathBuf> = WalkDir::new(input_dir)
        .map_ok(|entry| entry.path())
        .try_filter(|path| {
            let is_file = path.is_file();
            async move { is_file }
        })
        .try_collect()
        .await
        .context("Failed to walk the working directory")?;
    filepaths.sort();

    let mut collected = ProcessedTransactions::default();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for filepath in &filepaths {
        let rel_path = to_rel_posix(filepath, input_dir);
        for input in inputs {
            if !match_file(&input.r#match, &rel_path)? {
                continue;
            }
            let content = async_std::fs::read_to_string(filepath)
                .await
                .with_context(|| format!("Failed to read input file {rel_path}"))?;
            let file = SourceFile {
                path: rel_path.clone(),
                content,
            };
            let extractor = match input.config.extractor.as_deref() {
                Some(name) => match registry.get(name) {
                    Some(extractor) => extractor,
                    None => {
                        warn!("Extractor {name} not found for file {rel_path}, skip");
                        continue;
                    }
                },
                None => match registry.detect(&file) {
                    Some(extractor) => extractor,
                    None => {
                        warn!("No extractor detected for file {rel_path}, skip");
                        continue;
                    }
                },
            };
            info!(
                "Processing file {} with extractor {}",
                rel_path,
                extractor.name()
            );
            if let Ok(Some(fingerprint)) = extractor.fingerprint(&file) {
                debug!(
                    "File {} fingerprint: starting date {}, first row hash {}",
                    rel_path, fingerprint.starting_date, fingerprint.first_row_hash
                );
            }
            for record in extractor.process(&file)? {
                let record = record?.strip_base_path(input_dir);
                if let Some(filter) = &input.filter {
                    if !record_passes_filter(&record, filter)? {
                        continue;
                    }
                }
                let result = process_transaction(
                    renderer,
                    &input.config,
                    import_rules,
                    &record,
                    input.loop_vars.as_ref(),
                    Some(extractor.import_id_template()),
                )?;
                for output in result.outputs {
                    match output {
                        Output::Generated(txn) => {
                            if !stays_inside(input_dir, Path::new(&txn.file)) {
                                return Err(anyhow!(
                                    "Output file {} of transaction {} resolves outside the \
                                     working directory",
                                    txn.file,
                                    txn.id
                                ));
                            }
                            if !seen_ids.insert(txn.id.clone()) {
                                return Err(anyhow!(
                                    "Duplicate generated transaction id {}",
                                    txn.id
                                ));
                            }
                            collected.generated.push(txn);
                        }
                        Output::Deleted(txn) => collected.deleted.push(txn),
                    }
                }
                if let Some(unprocessed) = result.unprocessed {
                    collected.unprocessed.push(unprocessed);
                }
            }
            break;
        }
    }
    Ok(collected)
}
