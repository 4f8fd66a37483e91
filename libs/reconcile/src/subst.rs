//! Flat post-build variable substitution.
//!
//! Expansion runs once over the whole rendered text, not per field.
//! Supported forms:
//!
//! | form               | result                                      |
//! |--------------------|---------------------------------------------|
//! | `${name}`          | value, or empty when unset                  |
//! | `${name:=default}` | value, or `default` when unset or empty     |
//! | `${name:-default}` | same as `:=`                                |
//! | `${name=default}`  | value, or `default` only when unset         |
//! | `${name-default}`  | same as `=`                                 |
//! | `$name`            | value, or empty when unset                  |
//! | `$$`               | a literal `$`                               |
//!
//! A `$` followed by anything other than `{`, `$` or a name start is copied
//! through. Shell snippets in manifests must escape `$` as `$$`.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors from malformed expansion syntax.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubstituteError {
    #[error("line {line}: unterminated variable expression")]
    Unterminated { line: usize },

    #[error("line {line}: invalid variable name in ${{{expr}}}")]
    InvalidName { line: usize, expr: String },

    #[error("line {line}: unsupported operator in ${{{expr}}}")]
    UnsupportedOperator { line: usize, expr: String },
}

enum Fallback<'a> {
    None,
    /// Used when the variable is unset or empty.
    UnsetOrEmpty(&'a str),
    /// Used only when the variable is unset.
    Unset(&'a str),
}

/// Expand variables in `text`.
///
/// An empty variable map is a passthrough: the text is returned as-is,
/// even if it contains malformed expressions.
pub fn substitute(text: &str, vars: &BTreeMap<String, String>) -> Result<String, SubstituteError> {
    if vars.is_empty() {
        return Ok(text.to_string());
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut line = 1;

    while let Some(pos) = rest.find('$') {
        let (before, after) = rest.split_at(pos);
        line += before.matches('\n').count();
        out.push_str(before);

        let tail = &after[1..];
        if let Some(stripped) = tail.strip_prefix('$') {
            out.push('$');
            rest = stripped;
        } else if let Some(body) = tail.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or(SubstituteError::Unterminated { line })?;
            let expr = &body[..end];
            if expr.contains('\n') {
                return Err(SubstituteError::Unterminated { line });
            }
            out.push_str(&expand(expr, vars, line)?);
            rest = &body[end + 1..];
        } else if tail.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            let end = name_len(tail);
            out.push_str(vars.get(&tail[..end]).map_or("", String::as_str));
            rest = &tail[end..];
        } else {
            out.push('$');
            rest = tail;
        }
    }
    out.push_str(rest);

    Ok(out)
}

/// Length of the variable name at the start of `s`.
fn name_len(s: &str) -> usize {
    s.char_indices()
        .find(|(i, c)| !(c.is_ascii_alphanumeric() || *c == '_') || (*i == 0 && c.is_ascii_digit()))
        .map_or(s.len(), |(i, _)| i)
}

fn expand(expr: &str, vars: &BTreeMap<String, String>, line: usize) -> Result<String, SubstituteError> {
    let (name, op) = expr.split_at(name_len(expr));
    if name.is_empty() {
        return Err(SubstituteError::InvalidName {
            line,
            expr: expr.to_string(),
        });
    }

    let fallback = if op.is_empty() {
        Fallback::None
    } else if let Some(default) = op.strip_prefix(":=").or_else(|| op.strip_prefix(":-")) {
        Fallback::UnsetOrEmpty(default)
    } else if let Some(default) = op.strip_prefix('=').or_else(|| op.strip_prefix('-')) {
        Fallback::Unset(default)
    } else if op.starts_with(|c: char| c == ':' || c == '?' || c == '+' || c == '#' || c == '%') {
        return Err(SubstituteError::UnsupportedOperator {
            line,
            expr: expr.to_string(),
        });
    } else {
        return Err(SubstituteError::InvalidName {
            line,
            expr: expr.to_string(),
        });
    };

    let value = vars.get(name);
    let expanded = match (value, fallback) {
        (Some(v), Fallback::UnsetOrEmpty(default)) if v.is_empty() => default,
        (Some(v), _) => v.as_str(),
        (None, Fallback::UnsetOrEmpty(default) | Fallback::Unset(default)) => default,
        (None, Fallback::None) => "",
    };
    Ok(expanded.to_string())
}
