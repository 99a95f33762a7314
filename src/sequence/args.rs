//! Best-effort typed parsing of a sequence `Argument` cell.
//!
//! The parser never fails. Tokens that look like literals (integers, floats,
//! booleans, quoted strings, bracketed lists) are converted; everything else is
//! kept verbatim as a string.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static INT_LITERAL: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[+-]?\d+$").unwrap()
});

static FLOAT_LITERAL: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[+-]?(\d+\.\d*|\.\d+|\d+)([eE][+-]?\d+)?$").unwrap()
});

/// One typed argument token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// `True` or `False`.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Float literal, including exponent forms.
    Float(f64),
    /// Anything else, with surrounding quotes removed.
    Str(String),
    /// Bracketed or parenthesized group.
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// Numeric view of the token, if it is an integer or float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Int(i) => Some(*i as f64),
            ArgValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// String view of the token, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the token as an on/off switch.
    ///
    /// Accepts booleans, `0`/`1`, and `on`/`off` in any case.
    pub fn as_switch(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            ArgValue::Int(0) => Some(false),
            ArgValue::Int(1) => Some(true),
            ArgValue::Str(s) => match s.to_ascii_lowercase().as_str() {
                "on" => Some(true),
                "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(fl) => write!(f, "{}", fl),
            ArgValue::Str(s) => write!(f, "{}", s),
            ArgValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

/// Returns true for cells that mean "call with no arguments".
pub fn is_placeholder(cell: Option<&str>) -> bool {
    match cell {
        None => true,
        Some(text) => {
            let text = text.trim();
            text.is_empty() || text == "-"
        }
    }
}

/// Parse one `Argument` cell.
///
/// Returns `None` for absent, empty, or `-` cells, otherwise the list of
/// typed tokens in order.
pub fn parse_arguments(cell: Option<&str>) -> Option<Vec<ArgValue>> {
    if is_placeholder(cell) {
        return None;
    }
    let text = cell?.trim();

    if let Some(number) = parse_number(text) {
        return Some(vec![number]);
    }

    Some(tokenize(text).iter().map(|t| parse_token(t)).collect())
}

/// Number of top-level arguments in a cell, `None` counting as zero.
pub fn argument_count(cell: Option<&str>) -> usize {
    parse_arguments(cell).map_or(0, |args| args.len())
}

fn parse_number(text: &str) -> Option<ArgValue> {
    if INT_LITERAL.is_match(text) {
        if let Ok(i) = text.parse::<i64>() {
            return Some(ArgValue::Int(i));
        }
    }
    if FLOAT_LITERAL.is_match(text) {
        if let Ok(f) = text.parse::<f64>() {
            return Some(ArgValue::Float(f));
        }
    }
    None
}

/// Split on whitespace, keeping bracketed groups and quoted text together.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth: usize = 0;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        if let Some(open) = quote {
            current.push(c);
            if c == open {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' if depth == 0 && current.is_empty() => {
                quote = Some(c);
                current.push(c);
            }
            '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_token(token: &str) -> ArgValue {
    if let Some(number) = parse_number(token) {
        return number;
    }
    match token {
        "True" | "true" | "TRUE" => return ArgValue::Bool(true),
        "False" | "false" | "FALSE" => return ArgValue::Bool(false),
        _ => {}
    }
    if let Some(inner) = strip_pair(token, '\'', '\'').or_else(|| strip_pair(token, '"', '"')) {
        return ArgValue::Str(inner.to_string());
    }
    if let Some(inner) = strip_pair(token, '[', ']').or_else(|| strip_pair(token, '(', ')')) {
        return parse_group(inner);
    }
    ArgValue::Str(token.to_string())
}

fn parse_group(inner: &str) -> ArgValue {
    let parts: Vec<String> = if inner.contains(',') {
        split_top_level_commas(inner)
    } else {
        tokenize(inner)
    };
    ArgValue::List(
        parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(parse_token)
            .collect(),
    )
}

fn split_top_level_commas(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth: usize = 0;
    for c in text.chars() {
        match c {
            '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn strip_pair(token: &str, open: char, close: char) -> Option<&str> {
    if token.len() >= 2 && token.starts_with(open) && token.ends_with(close) {
        Some(&token[open.len_utf8()..token.len() - close.len_utf8()])
    } else {
        None
    }
}

/// Render values back into cell text that parses to the same tokens.
pub fn format_arguments(values: &[ArgValue]) -> String {
    values
        .iter()
        .map(format_token)
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_token(value: &ArgValue) -> String {
    match value {
        ArgValue::Float(f) if f.fract() == 0.0 && f.is_finite() => format!("{:.1}", f),
        ArgValue::List(items) => {
            let inner: Vec<String> = items.iter().map(format_token).collect();
            format!("[{}]", inner.join(","))
        }
        ArgValue::Str(text) if text.contains(char::is_whitespace) => format!("'{}'", text),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_mean_no_arguments() {
        assert_eq!(parse_arguments(None), None);
        assert_eq!(parse_arguments(Some("")), None);
        assert_eq!(parse_arguments(Some("   ")), None);
        assert_eq!(parse_arguments(Some("-")), None);
    }

    #[test]
    fn test_bare_integer_stays_integer() {
        assert_eq!(parse_arguments(Some("230")), Some(vec![ArgValue::Int(230)]));
        assert_eq!(parse_arguments(Some("49.5")), Some(vec![ArgValue::Float(49.5)]));
    }

    #[test]
    fn test_mixed_tokens_are_coerced_individually() {
        assert_eq!(
            parse_arguments(Some("Temp 25 10")),
            Some(vec![
                ArgValue::Str("Temp".into()),
                ArgValue::Int(25),
                ArgValue::Int(10)
            ])
        );
        assert_eq!(
            parse_arguments(Some("on")),
            Some(vec![ArgValue::Str("on".into())])
        );
        assert_eq!(
            parse_arguments(Some("True 'ac' -3.5e1")),
            Some(vec![
                ArgValue::Bool(true),
                ArgValue::Str("ac".into()),
                ArgValue::Float(-35.0)
            ])
        );
    }

    #[test]
    fn test_grouped_tokens_become_lists() {
        assert_eq!(
            parse_arguments(Some("[1 2] (3, 4.5) x")),
            Some(vec![
                ArgValue::List(vec![ArgValue::Int(1), ArgValue::Int(2)]),
                ArgValue::List(vec![ArgValue::Int(3), ArgValue::Float(4.5)]),
                ArgValue::Str("x".into()),
            ])
        );
    }

    #[test]
    fn test_malformed_literals_degrade_to_strings() {
        assert_eq!(
            parse_arguments(Some("nan 1.2.3 [open")),
            Some(vec![
                ArgValue::Str("nan".into()),
                ArgValue::Str("1.2.3".into()),
                ArgValue::Str("[open".into()),
            ])
        );
    }

    #[test]
    fn test_argument_count() {
        assert_eq!(argument_count(Some("-")), 0);
        assert_eq!(argument_count(Some("12")), 1);
        assert_eq!(argument_count(Some("Temp 25 10")), 3);
    }

    #[test]
    fn test_switch_interpretation() {
        assert_eq!(ArgValue::Str("ON".into()).as_switch(), Some(true));
        assert_eq!(ArgValue::Int(0).as_switch(), Some(false));
        assert_eq!(ArgValue::Str("maybe".into()).as_switch(), None);
    }

    #[test]
    fn test_format_keeps_float_type() {
        let text = format_arguments(&[ArgValue::Str("Temp".into()), ArgValue::Float(21.0)]);
        assert_eq!(text, "Temp 21.0");
        assert_eq!(
            parse_arguments(Some(&text)),
            Some(vec![ArgValue::Str("Temp".into()), ArgValue::Float(21.0)])
        );
    }

    #[test]
    fn test_quoted_text_stays_one_token() {
        assert_eq!(
            parse_arguments(Some("'Temp current' 25 5")),
            Some(vec![
                ArgValue::Str("Temp current".into()),
                ArgValue::Int(25),
                ArgValue::Int(5)
            ])
        );
        assert_eq!(
            parse_arguments(Some("\"a  b\" c")),
            Some(vec![ArgValue::Str("a  b".into()), ArgValue::Str("c".into())])
        );
        // An apostrophe inside a word does not open a quote.
        assert_eq!(argument_count(Some("don't stop")), 2);
    }

    #[test]
    fn test_format_quotes_text_with_spaces() {
        let values = vec![ArgValue::Str("Hum current".into()), ArgValue::Float(40.0)];
        let text = format_arguments(&values);
        assert_eq!(text, "'Hum current' 40.0");
        assert_eq!(parse_arguments(Some(&text)), Some(values));
    }
}
