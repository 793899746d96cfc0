use super::{Entry, StatementKind, Tree, TxnHeader};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;

/// Transaction flags recognized on a date directive
const TXN_FLAGS: &str = "*!&#?%PSTCURM";

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with(';')
}

fn leading_date(line: &str) -> Option<(NaiveDate, &str)> {
    let (token, rest) = line.split_once(char::is_whitespace)?;
    let date = NaiveDate::parse_from_str(token, "%Y-%m-%d").ok()?;
    Some((date, rest.trim_start()))
}

fn is_txn_flag(token: &str) -> bool {
    token == "txn"
        || (token.chars().count() == 1
            && token.chars().all(|c| TXN_FLAGS.contains(c)))
}

/// Scan the remainder of a transaction header: up to two quoted strings,
/// then `#tag` / `^link` annotations. A trailing `;` comment ends the scan.
fn scan_header_rest(rest: &str) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let mut strings = Vec::new();
    let mut hashtags = Vec::new();
    let mut links = Vec::new();
    let mut chars = rest.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == ';' {
            break;
        }
        if c == '"' {
            chars.next();
            let mut escaped = false;
            let mut end = None;
            for (i, c) in chars.by_ref() {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    end = Some(i);
                    break;
                }
            }
            let end = end.ok_or_else(|| anyhow!("Unterminated string in '{rest}'"))?;
            let raw = &rest[start..=end];
            let value: String = serde_json::from_str(raw)
                .with_context(|| format!("Invalid quoted string {raw}"))?;
            strings.push(value);
            continue;
        }
        let token: String = {
            let mut token = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            token
        };
        if let Some(tag) = token.strip_prefix('#') {
            hashtags.push(tag.to_string());
        } else if let Some(link) = token.strip_prefix('^') {
            links.push(link.to_string());
        }
        // anything else on the header line is ignored; the raw statement
        // text is what gets written back for untouched entries
    }
    hashtags.sort();
    links.sort();
    Ok((strings, hashtags, links))
}

fn parse_statement(line: &str) -> Result<StatementKind> {
    let Some((date, rest)) = leading_date(line) else {
        return Ok(StatementKind::Other { date: None });
    };
    let flag = rest
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    if !is_txn_flag(&flag) {
        return Ok(StatementKind::Other { date: Some(date) });
    }
    let rest = rest[flag.len()..].trim_start();
    let (mut strings, hashtags, links) = scan_header_rest(rest)?;
    let narration = strings.pop().unwrap_or_default();
    let payee = strings.pop();
    Ok(StatementKind::Transaction(TxnHeader {
        date,
        flag,
        payee,
        narration,
        hashtags,
        links,
    }))
}

/// Split a metadata line into its key and raw value. Metadata keys start
/// lowercase, which is what tells them apart from posting accounts.
pub fn split_metadata(line: &str) -> Option<(&str, &str)> {
    if !line.starts_with(char::is_whitespace) {
        return None;
    }
    let (key, value) = line.trim_start().split_once(':')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if !first.is_ascii_lowercase() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return None;
    }
    Some((key, value.trim()))
}

/// Decode a metadata line whose value is a quoted string
pub fn string_metadata(line: &str) -> Option<(&str, String)> {
    let (key, value) = split_metadata(line)?;
    if !value.starts_with('"') {
        return None;
    }
    let decoded: String = serde_json::from_str(value).ok()?;
    Some((key, decoded))
}

/// Path named by an `include` directive, if the statement is one
pub fn parse_include(statement: &str) -> Option<String> {
    let rest = statement.trim_start().strip_prefix("include")?;
    let rest = rest.trim();
    serde_json::from_str(rest).ok()
}

pub fn parse_tree(text: &str) -> Result<Tree> {
    let mut entries: Vec<Entry> = Vec::new();
    let mut pending_comments: Vec<String> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let lineno = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            if is_comment(line) {
                pending_comments.push(line.to_string());
                continue;
            }
            let kind = parse_statement(line)
                .with_context(|| format!("Malformed statement at line {lineno}"))?;
            entries.push(Entry {
                comments: std::mem::take(&mut pending_comments),
                lineno,
                statement: line.to_string(),
                kind,
                metadata: Vec::new(),
                postings: Vec::new(),
            });
            continue;
        }
        // indented: metadata or posting of the entry under construction
        let Some(entry) = entries.last_mut() else {
            pending_comments.push(line.to_string());
            continue;
        };
        if is_comment(line) {
            if entry.postings.is_empty() {
                entry.metadata.push(line.to_string());
            } else {
                entry.postings.push(line.to_string());
            }
        } else if split_metadata(line).is_some() && entry.postings.is_empty() {
            entry.metadata.push(line.to_string());
        } else {
            entry.postings.push(line.to_string());
        }
    }
    Ok(Tree {
        entries,
        tail_comments: pending_comments,
    })
}
