//! Detection of known table names inside free-form SQL.
//!
//! Any occurrence counts, whatever clause it sits in; this is usage
//! accounting, not query analysis.

use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::debug;

/// Names from `known` that `sql` references, each at most once, sorted.
///
/// Tokenizes with a generic SQL dialect and compares identifiers and string
/// literals case-insensitively. When tokenizing fails (or finds nothing) the
/// raw text is scanned for whole-word matches instead.
pub fn find_referenced_tables<S: AsRef<str>>(sql: &str, known: &[S]) -> Vec<String> {
    if known.is_empty() {
        return Vec::new();
    }

    let by_lower: HashMap<String, &str> = known
        .iter()
        .map(|name| (name.as_ref().to_lowercase(), name.as_ref()))
        .collect();

    let mut found = BTreeSet::new();
    match Tokenizer::new(&GenericDialect {}, sql).tokenize() {
        Ok(tokens) => {
            for token in &tokens {
                let Some(text) = token_text(token) else {
                    continue;
                };
                let clean = text.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
                if let Some(name) = by_lower.get(&clean.to_lowercase()) {
                    found.insert((*name).to_string());
                }
            }
        }
        Err(err) => {
            debug!(error = %err, "SQL tokenizer failed, falling back to regex scan");
        }
    }

    if found.is_empty() {
        for (_, name) in by_lower {
            if mentions_word(sql, name) {
                found.insert(name.to_string());
            }
        }
    }

    found.into_iter().collect()
}

fn token_text(token: &Token) -> Option<&str> {
    match token {
        Token::Word(word) => Some(word.value.as_str()),
        Token::SingleQuotedString(s) | Token::DoubleQuotedString(s) => Some(s.as_str()),
        _ => None,
    }
}

fn mentions_word(sql: &str, name: &str) -> bool {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(name));
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(sql),
        Err(err) => {
            debug!(table = name, error = %err, "Skipping table name in regex scan");
            false
        }
    }
}
