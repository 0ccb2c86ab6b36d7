//! Work items and their canonical textual forms.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One command invocation as an ordered argument list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem(Vec<String>);

impl WorkItem {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// Shell-safe invocation string used in generated scripts.
    pub fn invocation(&self) -> String {
        join_quoted(self.0.iter().map(String::as_str))
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.invocation())
    }
}

/// Quote one token for a POSIX shell.
///
/// Tokens made only of `[A-Za-z0-9@%+=:,./_-]` pass through unchanged.
pub fn shell_quote(token: &str) -> String {
    if token.is_empty() {
        return "''".to_string();
    }
    let safe = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r#"'"'"'"#))
}

fn join_quoted<'a>(tokens: impl Iterator<Item = &'a str>) -> String {
    tokens.map(shell_quote).collect::<Vec<_>>().join(" ")
}

/// A per-token rewrite applied before computing normalized text.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    fn apply(&self, token: &str) -> String {
        self.pattern
            .replace_all(token, self.replacement.as_str())
            .into_owned()
    }
}

/// Computes the identity key of a work item.
///
/// Rules run in order over every token, so a rule such as
/// `^.*/qecp-cli$ -> qecp-cli` makes cache hits survive binary relocation.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    rules: Vec<RewriteRule>,
}

impl Normalizer {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    pub fn normalize(&self, item: &WorkItem) -> String {
        if self.rules.is_empty() {
            return item.invocation();
        }
        let rewritten: Vec<String> = item
            .tokens()
            .iter()
            .map(|token| {
                self.rules
                    .iter()
                    .fold(token.clone(), |acc, rule| rule.apply(&acc))
            })
            .collect();
        join_quoted(rewritten.iter().map(String::as_str))
    }
}
