//! URL-scoped string substitution
//!
//! One function serves body rewriting, `Location` rewriting and path prefix
//! translation; callers pick the table and the mode.

use regex::Regex;

/// How a replacement applies to the text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Every occurrence of `from` is replaced
    Anywhere,
    /// Only a leading `from` is replaced
    Prefix,
}

/// One entry of a substitution table
#[derive(Debug, Clone)]
pub struct Replacement {
    pub from: String,
    pub to: String,
    /// URL scopes; empty means the entry applies to every URL
    pub urls: Vec<Regex>,
}

impl Replacement {
    pub fn new(from: impl Into<String>, to: impl Into<String>, urls: Vec<Regex>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            urls,
        }
    }

    /// Check whether this entry is scoped to the given URL
    pub fn applies_to(&self, url: &str) -> bool {
        self.urls.is_empty() || self.urls.iter().any(|re| re.is_match(url))
    }
}

/// Apply a substitution table to `text`.
///
/// Entries run in table order and each one sees the output of the previous
/// ones.
pub fn substitute(url: &str, text: &str, table: &[Replacement], mode: ReplaceMode) -> String {
    let mut out = text.to_string();

    for rep in table {
        if rep.from.is_empty() || !rep.applies_to(url) {
            continue;
        }

        match mode {
            ReplaceMode::Prefix => {
                if let Some(rest) = out.strip_prefix(rep.from.as_str()) {
                    out = format!("{}{}", rep.to, rest);
                }
            }
            ReplaceMode::Anywhere => {
                if out.contains(rep.from.as_str()) {
                    out = out.replace(rep.from.as_str(), &rep.to);
                }
            }
        }
    }

    out
}

/// Replace every non-overlapping `from` with `to`, left to right
fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.windows(from.len()).position(|w| w == from) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(to);
        rest = &rest[pos + from.len()..];
    }
    out.extend_from_slice(rest);
    out
}

/// Apply a substitution table to a body in anywhere mode.
///
/// Works on raw bytes so Latin-1 or binary bodies are rewritten too; on UTF-8
/// text it gives the same result as [`substitute`].
pub fn substitute_bytes(url: &str, body: &[u8], table: &[Replacement]) -> Vec<u8> {
    let mut out = body.to_vec();

    for rep in table {
        if rep.from.is_empty() || !rep.applies_to(url) {
            continue;
        }
        out = replace_bytes(&out, rep.from.as_bytes(), rep.to.as_bytes());
    }

    out
}
