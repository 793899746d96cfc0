use crate::config::{
    FileMatch, FilterOp, FilterPredicate, InputConfig, InputConfigDetails, InputFilter,
};
use crate::record::{FieldValue, Record};
use crate::template::{TemplateContext, TemplateRenderer};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use minijinja::value::Value;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub type LoopVars = BTreeMap<String, serde_json::Value>;

/// One concrete per-file input configuration produced by loop expansion.
/// Loop bindings stay attached so the transaction processor can expose
/// them to templates.
#[derive(Debug, Clone)]
pub struct RenderedInput {
    pub r#match: FileMatch,
    pub config: InputConfigDetails,
    pub filter: Option<Vec<FilterPredicate>>,
    pub loop_vars: Option<LoopVars>,
}

fn binding_context(renderer: &TemplateRenderer, binding: Option<&LoopVars>) -> TemplateContext {
    let mut ctx = TemplateContext::new();
    if let Some(binding) = binding {
        for (name, value) in binding {
            ctx.insert(name.clone(), Value::from_serialize(value));
        }
    }
    ctx.insert("omit".to_string(), Value::from(renderer.omit_token()));
    ctx
}

fn render_file_match(
    renderer: &TemplateRenderer,
    pattern: &FileMatch,
    ctx: &TemplateContext,
) -> Result<FileMatch> {
    let render = |template: &str| -> Result<String> {
        Ok(renderer.render(template, ctx)?.unwrap_or_default())
    };
    Ok(match pattern {
        FileMatch::Glob(glob) => FileMatch::Glob(render(glob)?),
        FileMatch::Equals { equals } => FileMatch::Equals {
            equals: render(equals)?,
        },
        FileMatch::Regex { regex } => FileMatch::Regex {
            regex: render(regex)?,
        },
    })
}

fn render_filter(
    renderer: &TemplateRenderer,
    filter: &InputFilter,
    ctx: &TemplateContext,
) -> Result<Vec<FilterPredicate>> {
    let predicates = match filter {
        InputFilter::Predicates(predicates) => predicates.clone(),
        InputFilter::Expr(expr) => {
            let rendered = renderer
                .render(expr, ctx)?
                .context("Filter expression rendered to nothing")?;
            serde_yaml::from_str(&rendered).with_context(|| {
                format!("Filter expression did not render to a predicate list: {rendered}")
            })?
        }
    };
    predicates
        .into_iter()
        .map(|predicate| {
            Ok(FilterPredicate {
                field: renderer
                    .render(&predicate.field, ctx)?
                    .unwrap_or_default(),
                op: predicate.op,
                value: renderer
                    .render(&predicate.value, ctx)?
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Fan each input declaration out into its concrete per-file
/// configurations: one per loop binding, or exactly one when no loop is
/// declared.
pub fn expand_inputs(
    renderer: &TemplateRenderer,
    inputs: &[InputConfig],
) -> Result<Vec<RenderedInput>> {
    let mut rendered = Vec::new();
    for input in inputs {
        let bindings: Vec<Option<&LoopVars>> = match &input.r#loop {
            Some(entries) => entries.iter().map(Some).collect(),
            None => vec![None],
        };
        for binding in bindings {
            let ctx = binding_context(renderer, binding);
            let mut config = input.config.clone();
            if binding.is_some() {
                config.extractor = match &input.config.extractor {
                    Some(template) => renderer
                        .render(template, &ctx)?
                        .filter(|name| !name.is_empty()),
                    None => None,
                };
            }
            let r#match = if binding.is_some() {
                render_file_match(renderer, &input.r#match, &ctx)?
            } else {
                input.r#match.clone()
            };
            let filter = input
                .filter
                .as_ref()
                .map(|filter| render_filter(renderer, filter, &ctx))
                .transpose()?;
            rendered.push(RenderedInput {
                r#match,
                config,
                filter,
                loop_vars: binding.cloned(),
            });
        }
    }
    Ok(rendered)
}

fn compare<T: PartialOrd>(left: T, op: FilterOp, right: T) -> bool {
    match op {
        FilterOp::Eq => left == right,
        FilterOp::Ne => left != right,
        FilterOp::Lt => left < right,
        FilterOp::Le => left <= right,
        FilterOp::Gt => left > right,
        FilterOp::Ge => left >= right,
    }
}

/// A record passes a filter iff every predicate passes. The textual value
/// is coerced to the record field's static type; a missing field fails the
/// predicate.
pub fn record_passes_filter(record: &Record, predicates: &[FilterPredicate]) -> Result<bool> {
    for predicate in predicates {
        let Some(field) = record.field(&predicate.field) else {
            return Ok(false);
        };
        let value = predicate.value.as_str();
        let passed = match field {
            FieldValue::Str(s) => compare(s, predicate.op, value),
            FieldValue::Int(i) => compare(
                i,
                predicate.op,
                value
                    .parse::<i64>()
                    .with_context(|| format!("Invalid integer filter value '{value}'"))?,
            ),
            FieldValue::Decimal(d) => compare(
                d,
                predicate.op,
                value
                    .parse::<Decimal>()
                    .with_context(|| format!("Invalid decimal filter value '{value}'"))?,
            ),
            FieldValue::Date(d) => compare(
                d,
                predicate.op,
                value
                    .parse::<NaiveDate>()
                    .with_context(|| format!("Invalid date filter value '{value}'"))?,
            ),
            FieldValue::DateTime(t) => compare(
                t,
                predicate.op,
                value
                    .parse::<NaiveDateTime>()
                    .with_context(|| format!("Invalid datetime filter value '{value}'"))?,
            ),
            FieldValue::Bool(b) => compare(
                b,
                predicate.op,
                value
                    .parse::<bool>()
                    .with_context(|| format!("Invalid boolean filter value '{value}'"))?,
            ),
        };
        if !passed {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod inputs_tests {
    use super::*;
    use anyhow::Result;
    use indoc::indoc;

    #[test]
    fn loop_yields_one_rendered_config_per_binding() -> Result<()> {
        let input: InputConfig = serde_yaml::from_str(indoc! {r#"
            match: "import-data/connect/{{ match_path }}"
            config:
              extractor: "{{ src_extractor }}"
            loop:
              - match_path: bar.csv
                src_extractor: mercury
              - match_path: eggs.csv
                src_extractor: chase
        "#})?;
        let renderer = TemplateRenderer::new(None);
        let rendered = expand_inputs(&renderer, &[input])?;
        assert_eq!(rendered.len(), 2);
        assert_eq!(
            rendered[0].r#match,
            FileMatch::Glob("import-data/connect/bar.csv".to_string())
        );
        assert_eq!(rendered[0].config.extractor.as_deref(), Some("mercury"));
        assert_eq!(
            rendered[1].r#match,
            FileMatch::Glob("import-data/connect/eggs.csv".to_string())
        );
        assert_eq!(rendered[1].config.extractor.as_deref(), Some("chase"));
        assert!(rendered[0].loop_vars.is_some());
        Ok(())
    }

    #[test]
    fn extractor_rendering_to_omit_is_unspecified() -> Result<()> {
        let input: InputConfig = serde_yaml::from_str(indoc! {r#"
            match: "{{ match_path }}"
            config:
              extractor: "{{ src_extractor | default(omit) }}"
            loop:
              - match_path: bar.csv
        "#})?;
        let renderer = TemplateRenderer::new(None);
        let rendered = expand_inputs(&renderer, &[input])?;
        assert_eq!(rendered[0].config.extractor, None);
        Ok(())
    }

    #[test]
    fn unlooped_input_passes_through_once() -> Result<()> {
        let input: InputConfig = serde_yaml::from_str(indoc! {r#"
            match: "*.csv"
            config:
              extractor: mercury
        "#})?;
        let renderer = TemplateRenderer::new(None);
        let rendered = expand_inputs(&renderer, &[input])?;
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].r#match, FileMatch::Glob("*.csv".to_string()));
        assert_eq!(rendered[0].loop_vars, None);
        Ok(())
    }

    #[test]
    fn filter_expression_renders_to_predicates() -> Result<()> {
        let input: InputConfig = serde_yaml::from_str(indoc! {r#"
            match: "*.csv"
            config:
              extractor: mercury
            filter: "[{field: amount, op: '>=', value: '{{ threshold }}'}]"
            loop:
              - threshold: "100"
        "#})?;
        let renderer = TemplateRenderer::new(None);
        let rendered = expand_inputs(&renderer, &[input])?;
        assert_eq!(
            rendered[0].filter,
            Some(vec![FilterPredicate {
                field: "amount".to_string(),
                op: FilterOp::Ge,
                value: "100".to_string(),
            }])
        );
        Ok(())
    }

    fn record() -> Record {
        Record {
            extractor: "mercury".to_string(),
            date: Some("2024-04-16".parse().unwrap()),
            desc: Some("Amazon Web Services".to_string()),
            amount: Some("-353.63".parse().unwrap()),
            lineno: Some(2),
            ..Record::default()
        }
    }

    fn predicate(field: &str, op: FilterOp, value: &str) -> FilterPredicate {
        FilterPredicate {
            field: field.to_string(),
            op,
            value: value.to_string(),
        }
    }

    #[test]
    fn filter_coerces_by_field_type() -> Result<()> {
        let record = record();
        assert!(record_passes_filter(
            &record,
            &[predicate("amount", FilterOp::Lt, "0")]
        )?);
        assert!(record_passes_filter(
            &record,
            &[predicate("amount", FilterOp::Eq, "-353.63")]
        )?);
        assert!(record_passes_filter(
            &record,
            &[predicate("date", FilterOp::Ge, "2024-04-01")]
        )?);
        assert!(record_passes_filter(
            &record,
            &[predicate("lineno", FilterOp::Eq, "2")]
        )?);
        assert!(record_passes_filter(
            &record,
            &[predicate("desc", FilterOp::Ne, "GitHub")]
        )?);
        Ok(())
    }

    #[test]
    fn all_predicates_must_pass() -> Result<()> {
        let record = record();
        assert!(!record_passes_filter(
            &record,
            &[
                predicate("amount", FilterOp::Lt, "0"),
                predicate("desc", FilterOp::Eq, "GitHub"),
            ]
        )?);
        Ok(())
    }

    #[test]
    fn missing_field_fails_the_filter() -> Result<()> {
        assert!(!record_passes_filter(
            &record(),
            &[predicate("payee", FilterOp::Eq, "anyone")]
        )?);
        Ok(())
    }

    #[test]
    fn bad_coercion_is_an_error() {
        assert!(record_passes_filter(
            &record(),
            &[predicate("amount", FilterOp::Eq, "not-a-number")]
        )
        .is_err());
    }
}
