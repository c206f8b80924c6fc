//! Error-rule tables supplied as configuration data.
//!
//! A table is an ordered list of `[[rule]]` entries. Each entry names the fault
//! codes and/or fault kinds it matches and exactly one outcome:
//!
//! ```toml
//! [[rule]]
//! codes = ["DBInstanceNotFound"]
//! fail_with = "NotFound"
//!
//! [[rule]]
//! kinds = ["access-denied"]
//! ignore = true
//! ```

use crate::codes::{ErrorStatus, FaultKind, HandlerErrorCode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleTableError {
    #[error("failed to read rule table: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse rule table: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("rule #{index} matches nothing: set `codes` or `kinds`")]
    EmptyMatcher { index: usize },
    #[error("rule #{index} must set exactly one of `fail_with` or `ignore = true`")]
    AmbiguousOutcome { index: usize },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuleTable {
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub kinds: Vec<FaultKind>,
    #[serde(default)]
    pub fail_with: Option<HandlerErrorCode>,
    #[serde(default)]
    pub ignore: bool,
}

impl RuleEntry {
    pub fn status(&self) -> Option<ErrorStatus> {
        match (self.fail_with, self.ignore) {
            (Some(code), false) => Some(ErrorStatus::FailWith(code)),
            (None, true) => Some(ErrorStatus::Ignore),
            _ => None,
        }
    }
}

impl RuleTable {
    pub fn validate(&self) -> Result<(), RuleTableError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.codes.is_empty() && rule.kinds.is_empty() {
                return Err(RuleTableError::EmptyMatcher { index });
            }
            if rule.status().is_none() {
                return Err(RuleTableError::AmbiguousOutcome { index });
            }
        }
        Ok(())
    }
}

pub fn parse_rule_table_str(input: &str) -> Result<RuleTable, RuleTableError> {
    let table: RuleTable = toml::from_str(input)?;
    table.validate()?;
    Ok(table)
}

pub fn parse_rule_table_file(path: impl AsRef<Path>) -> Result<RuleTable, RuleTableError> {
    let content = fs::read_to_string(path)?;
    parse_rule_table_str(&content)
}
