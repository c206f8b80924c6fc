use crate::model::{DbInstanceModel, ParameterGroupModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("manifest declares no resource, expected [db_instance] or [db_parameter_group]")]
    NoResource,
    #[error("manifest declares more than one resource")]
    MultipleResources,
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("manifest describes {found}, but the previous state describes {expected}")]
    ResourceMismatch { expected: String, found: String },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestV1 {
    pub manifest_version: u32,
    #[serde(default)]
    pub db_instance: Option<DbInstanceModel>,
    #[serde(default)]
    pub db_parameter_group: Option<ParameterGroupModel>,
    /// Resource-level tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Tags applied by the surrounding stack; merged under resource tags.
    #[serde(default)]
    pub system_tags: BTreeMap<String, String>,
}

/// The single resource a manifest describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredResource {
    DbInstance(DbInstanceModel),
    DbParameterGroup(ParameterGroupModel),
}

impl DesiredResource {
    pub fn kind(&self) -> &'static str {
        match self {
            DesiredResource::DbInstance(_) => "db-instance",
            DesiredResource::DbParameterGroup(_) => "db-parameter-group",
        }
    }

    /// Stable key identifying the logical resource, e.g. `db-instance/orders-db`.
    pub fn key(&self) -> String {
        match self {
            DesiredResource::DbInstance(m) => format!("{}/{}", self.kind(), m.identifier),
            DesiredResource::DbParameterGroup(m) => format!("{}/{}", self.kind(), m.name),
        }
    }
}

impl fmt::Display for DesiredResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl ManifestV1 {
    /// Validate the manifest and return the resource it declares.
    pub fn resource(&self) -> Result<DesiredResource, ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        match (&self.db_instance, &self.db_parameter_group) {
            (Some(_), Some(_)) => Err(ManifestError::MultipleResources),
            (None, None) => Err(ManifestError::NoResource),
            (Some(instance), None) => {
                if instance.identifier.trim().is_empty() {
                    return Err(ManifestError::EmptyField("db_instance.identifier"));
                }
                Ok(DesiredResource::DbInstance(instance.clone()))
            }
            (None, Some(group)) => {
                if group.name.trim().is_empty() {
                    return Err(ManifestError::EmptyField("db_parameter_group.name"));
                }
                if group.family.trim().is_empty() {
                    return Err(ManifestError::EmptyField("db_parameter_group.family"));
                }
                Ok(DesiredResource::DbParameterGroup(group.clone()))
            }
        }
    }
}

pub fn parse_manifest_str(input: &str) -> Result<ManifestV1, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<ManifestV1, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParameterValue;

    #[test]
    fn parses_db_instance_manifest() {
        let m = parse_manifest_str(
            r#"
manifest_version = 1

[db_instance]
identifier = "orders-db"
engine = "postgres"
engine_version = "15.4"
db_parameter_group_name = "orders-pg15"
allocated_storage = 100
vpc_security_groups = ["sg-1"]

[[db_instance.associated_roles]]
role_arn = "arn:aws:iam::1:role/s3-import"
feature_name = "s3Import"

[tags]
team = "payments"
"#,
        )
        .unwrap();

        let DesiredResource::DbInstance(instance) = m.resource().unwrap() else {
            panic!("expected a db instance");
        };
        assert_eq!(instance.identifier, "orders-db");
        assert_eq!(instance.allocated_storage, Some(100));
        assert_eq!(instance.associated_roles.len(), 1);
        assert_eq!(m.tags.get("team").map(String::as_str), Some("payments"));
    }

    #[test]
    fn parses_parameter_group_with_mixed_values() {
        let m = parse_manifest_str(
            r#"
manifest_version = 1

[db_parameter_group]
name = "orders-pg15"
family = "postgres15"

[db_parameter_group.parameters]
max_connections = 200
log_statement = "ddl"
rds.force_ssl = true
"#,
        );
        // Dotted keys nest in TOML, so quote them in real manifests.
        assert!(m.is_err());

        let m = parse_manifest_str(
            r#"
manifest_version = 1

[db_parameter_group]
name = "orders-pg15"
family = "postgres15"

[db_parameter_group.parameters]
max_connections = 200
log_statement = "ddl"
"rds.force_ssl" = true
"#,
        )
        .unwrap();
        let group = m.db_parameter_group.unwrap();
        assert_eq!(
            group.parameters.get("max_connections"),
            Some(&ParameterValue::Integer(200))
        );
        assert_eq!(
            group.parameters.get("rds.force_ssl"),
            Some(&ParameterValue::Boolean(true))
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let m = parse_manifest_str(
            r#"
manifest_version = 2
[db_instance]
identifier = "x"
"#,
        )
        .unwrap();
        assert!(matches!(
            m.resource(),
            Err(ManifestError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_two_resources() {
        let m = parse_manifest_str(
            r#"
manifest_version = 1
[db_instance]
identifier = "x"
[db_parameter_group]
name = "y"
family = "postgres15"
"#,
        )
        .unwrap();
        assert!(matches!(m.resource(), Err(ManifestError::MultipleResources)));
    }

    #[test]
    fn rejects_empty_manifest() {
        let m = parse_manifest_str("manifest_version = 1\n").unwrap();
        assert!(matches!(m.resource(), Err(ManifestError::NoResource)));
    }

    #[test]
    fn rejects_blank_identifier() {
        let m = parse_manifest_str(
            r#"
manifest_version = 1
[db_instance]
identifier = "  "
"#,
        )
        .unwrap();
        assert!(matches!(m.resource(), Err(ManifestError::EmptyField(_))));
    }

    #[test]
    fn rejects_unknown_fields() {
        let r = parse_manifest_str(
            r#"
manifest_version = 1
[db_instance]
identifier = "x"
colour = "blue"
"#,
        );
        assert!(r.is_err());
    }

    #[test]
    fn resource_key_is_kind_and_name() {
        let m = parse_manifest_str(
            r#"
manifest_version = 1
[db_parameter_group]
name = "orders-pg15"
family = "postgres15"
"#,
        )
        .unwrap();
        assert_eq!(m.resource().unwrap().key(), "db-parameter-group/orders-pg15");
    }

    #[test]
    fn parse_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desired.toml");
        std::fs::write(&path, "manifest_version = 1\n[db_instance]\nidentifier = \"a\"\n").unwrap();
        let m = parse_manifest_file(&path).unwrap();
        assert!(m.db_instance.is_some());
    }
}
