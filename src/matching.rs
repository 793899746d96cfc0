use crate::config::{FileMatch, StrMatch, TxnMatchRule, TxnMatchVars};
use crate::record::Record;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;

/// Match a regex anchored at the start of the value, the way the rule
/// language reads bare string patterns.
fn regex_match(pattern: &str, value: &str) -> Result<bool> {
    let regex =
        Regex::new(pattern).with_context(|| format!("Invalid match pattern '{pattern}'"))?;
    Ok(regex.find(value).map_or(false, |m| m.start() == 0))
}

/// Parse a date with the given strftime format, tolerating formats that
/// carry a time component.
fn parse_date_with(format: &str, value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, format)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(value, format).ok().map(|t| t.date()))
}

/// Parse the bound of a date pattern; a bound that does not parse is a
/// configuration error rather than a non-match.
fn parse_bound(format: &str, bound: &str) -> Result<NaiveDate> {
    parse_date_with(format, bound)
        .with_context(|| format!("Invalid date bound '{bound}' for format '{format}'"))
}

/// Evaluate one string pattern against an optional field value. A missing
/// value never matches.
pub fn match_str(pattern: &StrMatch, value: Option<&str>) -> Result<bool> {
    let Some(value) = value else {
        return Ok(false);
    };
    match pattern {
        StrMatch::Bare(regex) | StrMatch::Regex { regex } => regex_match(regex, value),
        StrMatch::Equals { equals } => Ok(value == equals),
        StrMatch::Prefix { prefix } => Ok(value.starts_with(prefix)),
        StrMatch::Suffix { suffix } => Ok(value.ends_with(suffix)),
        StrMatch::Contains { contains } => Ok(value.contains(contains)),
        StrMatch::OneOf {
            one_of,
            regex,
            ignore_case,
        } => {
            let folded;
            let value = if *ignore_case {
                folded = value.to_lowercase();
                folded.as_str()
            } else {
                value
            };
            for member in one_of {
                let member = if *ignore_case {
                    member.to_lowercase()
                } else {
                    member.clone()
                };
                let matched = if *regex {
                    regex_match(&member, value)?
                } else {
                    member == value
                };
                if matched {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        StrMatch::DateBefore {
            date_before,
            format,
        } => {
            let bound = parse_bound(format, date_before)?;
            Ok(parse_date_with(format, value).map_or(false, |date| date < bound))
        }
        StrMatch::DateAfter { date_after, format } => {
            let bound = parse_bound(format, date_after)?;
            Ok(parse_date_with(format, value).map_or(false, |date| date > bound))
        }
        StrMatch::DateSameDay {
            date_same_day,
            format,
        } => {
            let bound = parse_bound(format, date_same_day)?;
            Ok(parse_date_with(format, value).map_or(false, |date| date == bound))
        }
        StrMatch::DateSameMonth {
            date_same_month,
            format,
        } => {
            let bound = parse_bound(format, date_same_month)?;
            Ok(parse_date_with(format, value).map_or(false, |date| {
                date.year() == bound.year() && date.month() == bound.month()
            }))
        }
        StrMatch::DateSameYear {
            date_same_year,
            format,
        } => {
            let bound = parse_bound(format, date_same_year)?;
            Ok(parse_date_with(format, value).map_or(false, |date| date.year() == bound.year()))
        }
    }
}

/// Evaluate a file pattern against a path relative to the working
/// directory. Bare strings glob over path components, anchored at the
/// right the way path matching conventionally works.
pub fn match_file(pattern: &FileMatch, filepath: &str) -> Result<bool> {
    match pattern {
        FileMatch::Glob(pattern) => {
            let path_parts: Vec<&str> = filepath.split('/').collect();
            let pattern_parts: Vec<&str> = pattern.split('/').collect();
            if pattern_parts.len() > path_parts.len() {
                return Ok(false);
            }
            let tail = &path_parts[path_parts.len() - pattern_parts.len()..];
            for (part, pattern_part) in tail.iter().zip(pattern_parts.iter()) {
                let matcher = glob::Pattern::new(pattern_part)
                    .with_context(|| format!("Invalid file match pattern '{pattern}'"))?;
                if !matcher.matches(part) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FileMatch::Equals { equals } => Ok(filepath == equals),
        FileMatch::Regex { regex } => regex_match(regex, filepath),
    }
}

/// A record matches a rule map iff every present pattern passes against
/// the corresponding field.
pub fn match_transaction(record: &Record, rule: &TxnMatchRule) -> Result<bool> {
    for (field, pattern) in rule.patterns() {
        if !match_str(pattern, record.field_str(field).as_deref())? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Resolve a record against the list form of a rule's match: the first
/// subrule whose condition passes together with the common condition wins.
pub fn match_transaction_with_vars<'a>(
    record: &Record,
    subrules: &'a [TxnMatchVars],
    common_cond: Option<&TxnMatchRule>,
) -> Result<Option<&'a TxnMatchVars>> {
    for subrule in subrules {
        if match_transaction(record, &subrule.cond)?
            && match common_cond {
                Some(common) => match_transaction(record, common)?,
                None => true,
            }
        {
            return Ok(Some(subrule));
        }
    }
    Ok(None)
}
