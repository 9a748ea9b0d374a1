// SPDX-License-Identifier: GPL-3.0-or-later

//! Package requirement strings (`name[extras]specifier ; marker`).
//!
//! Only the subset of the dependency-specifier grammar that appears in
//! project manifests is understood: a distribution name, optional extras,
//! either a version specifier set or a direct `@ url` reference, and an
//! optional environment marker kept verbatim.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{CliError, Result};

const OPERATORS: &[&str] = &["===", "~=", "==", "!=", "<=", ">=", "<", ">"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: BTreeSet<String>,
    /// Comma-separated specifier set without whitespace; empty when absent.
    pub specifier: String,
    pub url: Option<String>,
    pub marker: Option<String>,
}

impl Requirement {
    /// Normalised project name used for comparisons (`Foo_Bar` and
    /// `foo-bar` name the same distribution).
    pub fn canonical_name(&self) -> String {
        canonicalize(&self.name)
    }

    pub fn same_project(&self, other: &Requirement) -> bool {
        self.canonical_name() == other.canonical_name()
    }

    /// The same requirement without any version constraint.
    pub fn unversioned(&self) -> Requirement {
        Requirement {
            specifier: String::new(),
            url: None,
            ..self.clone()
        }
    }

    /// Combine two requirements for the same project. `other` wins for the
    /// specifier, url and marker when it has one; extras are united.
    pub fn merge(&self, other: &Requirement) -> Requirement {
        let specifier = if other.specifier.is_empty() && other.url.is_none() {
            self.specifier.clone()
        } else {
            other.specifier.clone()
        };
        let url = if other.specifier.is_empty() {
            other.url.clone().or_else(|| self.url.clone())
        } else {
            None
        };
        Requirement {
            name: self.name.clone(),
            extras: self.extras.union(&other.extras).cloned().collect(),
            specifier,
            url,
            marker: other.marker.clone().or_else(|| self.marker.clone()),
        }
    }

    /// Remove `removal` from `self`. A removal without extras drops the whole
    /// requirement (`None`); otherwise only the named extras are trimmed.
    pub fn subtract(&self, removal: &Requirement) -> Option<Requirement> {
        if removal.extras.is_empty() {
            return None;
        }
        Some(Requirement {
            extras: self.extras.difference(&removal.extras).cloned().collect(),
            ..self.clone()
        })
    }
}

pub(crate) fn canonicalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            in_separator = true;
            continue;
        }
        if in_separator && !out.is_empty() {
            out.push('-');
        }
        in_separator = false;
        out.push(ch.to_ascii_lowercase());
    }
    out
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')
}

fn invalid(input: &str, reason: impl Into<String>) -> CliError {
    CliError::InvalidRequirement {
        input: input.to_string(),
        reason: reason.into(),
    }
}

impl FromStr for Requirement {
    type Err = CliError;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (body, marker) = match trimmed.split_once(';') {
            Some((body, marker)) => {
                let marker = marker.trim();
                if marker.is_empty() {
                    return Err(invalid(input, "empty environment marker"));
                }
                (body.trim(), Some(marker.to_string()))
            }
            None => (trimmed, None),
        };

        let name_len = body.find(|ch| !is_name_char(ch)).unwrap_or(body.len());
        let name = &body[..name_len];
        if name.is_empty()
            || !name.starts_with(|c: char| c.is_ascii_alphanumeric())
            || !name.ends_with(|c: char| c.is_ascii_alphanumeric())
        {
            return Err(invalid(input, "missing or malformed project name"));
        }

        let mut rest = body[name_len..].trim_start();
        let mut extras = BTreeSet::new();
        if let Some(after) = rest.strip_prefix('[') {
            let Some((list, tail)) = after.split_once(']') else {
                return Err(invalid(input, "unterminated extras"));
            };
            for extra in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                if !extra.chars().all(is_name_char) {
                    return Err(invalid(input, format!("malformed extra {extra:?}")));
                }
                extras.insert(extra.to_string());
            }
            rest = tail.trim_start();
        }

        let mut specifier = String::new();
        let mut url = None;
        if let Some(reference) = rest.strip_prefix('@') {
            let reference = reference.trim();
            if reference.is_empty() {
                return Err(invalid(input, "empty url after '@'"));
            }
            url = Some(reference.to_string());
        } else if !rest.is_empty() {
            let rest = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .unwrap_or(rest);
            let compact: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
            for clause in compact.split(',') {
                let Some(op) = OPERATORS.iter().find(|op| clause.starts_with(**op)) else {
                    return Err(invalid(input, format!("malformed version clause {clause:?}")));
                };
                if clause.len() == op.len() {
                    return Err(invalid(input, format!("missing version after {op:?}")));
                }
            }
            specifier = compact;
        }

        Ok(Requirement {
            name: name.to_string(),
            extras,
            specifier,
            url,
            marker,
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            let extras: Vec<&str> = self.extras.iter().map(String::as_str).collect();
            write!(f, "[{}]", extras.join(","))?;
        }
        f.write_str(&self.specifier)?;
        if let Some(url) = &self.url {
            write!(f, " @ {url}")?;
        }
        if let Some(marker) = &self.marker {
            // A url must be separated from the marker by whitespace.
            let sep = if self.url.is_some() { " ; " } else { "; " };
            write!(f, "{sep}{marker}")?;
        }
        Ok(())
    }
}
