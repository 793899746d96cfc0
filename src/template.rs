use crate::record::Record;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use minijinja::value::{Object, ObjectRepr, Value};
use minijinja::Environment;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Template rendering context for one record: every record field, any
/// loop / matched variables, and the run's omit sentinel.
pub type TemplateContext = BTreeMap<String, Value>;

/// Sandboxed expression renderer shared by a whole run. minijinja gives no
/// filesystem or process access to templates; the only extensions are the
/// filters registered here. Rendering to the run-unique omit token reads as
/// "field absent".
pub struct TemplateRenderer {
    env: Environment<'static>,
    omit: String,
}

/// Date exposed to templates: renders in ISO form, with `year`, `month`
/// and `day` attributes.
#[derive(Debug)]
struct TemplateDate(NaiveDate);

impl fmt::Display for TemplateDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Object for TemplateDate {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "year" => Some(Value::from(self.0.year())),
            "month" => Some(Value::from(self.0.month())),
            "day" => Some(Value::from(self.0.day())),
            _ => None,
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn as_posix_path(value: String) -> String {
    value.replace('\\', "/")
}

/// `default` with the boolean flag: `default(x)` replaces missing values,
/// `default(x, true)` replaces empty ones as well.
fn default_filter(value: Value, other: Option<Value>, boolean: Option<bool>) -> Value {
    let fallback = other.unwrap_or_else(|| Value::from(""));
    let replace = if boolean.unwrap_or(false) {
        !value.is_true()
    } else {
        value.is_undefined() || value.is_none()
    };
    if replace {
        fallback
    } else {
        value
    }
}

/// Amounts join the context as numbers so templates can do arithmetic on
/// them. Integral decimals stay integers to keep their rendering clean.
fn decimal_value(decimal: Decimal) -> Value {
    if decimal.fract().is_zero() {
        if let Some(int) = decimal.to_i64() {
            return Value::from(int);
        }
    }
    Value::from(decimal.to_f64().unwrap_or_default())
}

impl TemplateRenderer {
    pub fn new(context: Option<&BTreeMap<String, serde_json::Value>>) -> Self {
        let mut env = Environment::new();
        env.add_filter("as_posix_path", as_posix_path);
        env.add_filter("default", default_filter);
        if let Some(globals) = context {
            for (name, value) in globals {
                env.add_global(name.clone(), Value::from_serialize(value));
            }
        }
        TemplateRenderer {
            env,
            omit: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// The run-unique opaque sentinel exposed to templates as `omit`
    pub fn omit_token(&self) -> &str {
        &self.omit
    }

    /// Render a template; a result equal to the omit token becomes `None`
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<Option<String>> {
        let rendered = self
            .env
            .render_str(template, ctx)
            .with_context(|| format!("Failed to render template '{template}'"))?;
        if rendered == self.omit {
            Ok(None)
        } else {
            Ok(Some(rendered))
        }
    }

    /// Like `render`, passing an absent template through as `None`
    pub fn render_optional(
        &self,
        template: Option<&str>,
        ctx: &TemplateContext,
    ) -> Result<Option<String>> {
        match template {
            Some(template) => self.render(template, ctx),
            None => Ok(None),
        }
    }

    /// Build the rendering context for one record. Unset record fields are
    /// left out entirely so they render as empty rather than as a literal
    /// null.
    pub fn record_context(&self, record: &Record) -> Result<TemplateContext> {
        let serialized =
            serde_json::to_value(record).context("Failed to serialize record fields")?;
        let serde_json::Value::Object(fields) = serialized else {
            anyhow::bail!("Record context must be a mapping");
        };
        let mut ctx: TemplateContext = fields
            .into_iter()
            .map(|(name, value)| (name, Value::from_serialize(&value)))
            .collect();
        if let Some(date) = record.date {
            ctx.insert("date".to_string(), Value::from_object(TemplateDate(date)));
        }
        if let Some(post_date) = record.post_date {
            ctx.insert(
                "post_date".to_string(),
                Value::from_object(TemplateDate(post_date)),
            );
        }
        if let Some(amount) = record.amount {
            ctx.insert("amount".to_string(), decimal_value(amount));
        }
        ctx.insert("omit".to_string(), Value::from(self.omit.clone()));
        Ok(ctx)
    }
}
