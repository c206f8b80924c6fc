//! Desired-state manifests, resource models, and shared vocabulary for converge.
//!
//! This crate defines the schema layer: TOML manifest parsing (`ManifestV1`),
//! the resource models reconciled by the handlers (`DbInstanceModel`,
//! `ParameterGroupModel`), identifier newtypes, the closed set of outcome codes
//! (`HandlerErrorCode`), and error-rule tables loaded from configuration.

pub mod codes;
pub mod manifest;
pub mod model;
pub mod rules;
pub mod types;

pub use codes::{ErrorStatus, FaultKind, HandlerErrorCode};
pub use manifest::{
    parse_manifest_file, parse_manifest_str, DesiredResource, ManifestError, ManifestV1,
};
pub use model::{merge_tags, DbInstanceModel, DbInstanceRole, ParameterGroupModel, ParameterValue, Tag};
pub use rules::{parse_rule_table_file, parse_rule_table_str, RuleEntry, RuleTable, RuleTableError};
pub use types::{DbInstanceIdentifier, ParameterGroupName, ResourceArn};
