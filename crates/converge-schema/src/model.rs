use crate::types::{DbInstanceIdentifier, ParameterGroupName, ResourceArn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Desired (and, after a read, observed) attributes of a database instance.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DbInstanceModel {
    pub identifier: DbInstanceIdentifier,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub db_instance_class: Option<String>,
    #[serde(default)]
    pub db_parameter_group_name: Option<ParameterGroupName>,
    #[serde(default)]
    pub allocated_storage: Option<u32>,
    #[serde(default)]
    pub max_allocated_storage: Option<u32>,
    #[serde(default)]
    pub storage_encrypted: Option<bool>,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(default)]
    pub character_set_name: Option<String>,
    #[serde(default)]
    pub vpc_security_groups: Vec<String>,
    #[serde(default)]
    pub associated_roles: Vec<DbInstanceRole>,

    /// Observed attributes, filled by a read. Ignored when diffing desired state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<ResourceArn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(deny_unknown_fields)]
pub struct DbInstanceRole {
    pub role_arn: String,
    pub feature_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ParameterGroupModel {
    pub name: ParameterGroupName,
    pub family: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<ResourceArn>,
}

/// A parameter value as written in a manifest. The control plane only deals in
/// strings, so every variant renders to its textual form.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ParameterValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Text(s) => f.write_str(s),
            ParameterValue::Integer(i) => write!(f, "{i}"),
            ParameterValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(s: &str) -> Self {
        ParameterValue::Text(s.to_owned())
    }
}

/// A resource tag. Ordering makes set differences deterministic.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }
}

/// Merge tag maps left to right; later maps win on key collisions.
pub fn merge_tags<'a>(maps: impl IntoIterator<Item = &'a BTreeMap<String, String>>) -> Vec<Tag> {
    let mut merged = BTreeMap::new();
    for map in maps {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
        .into_iter()
        .map(|(key, value)| Tag { key, value })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_value_renders_textually() {
        assert_eq!(ParameterValue::Integer(200).to_string(), "200");
        assert_eq!(ParameterValue::Boolean(true).to_string(), "true");
        assert_eq!(ParameterValue::from("utf8").to_string(), "utf8");
    }

    #[test]
    fn merge_tags_later_wins() {
        let mut system = BTreeMap::new();
        system.insert("owner".to_owned(), "platform".to_owned());
        system.insert("stack".to_owned(), "orders".to_owned());
        let mut resource = BTreeMap::new();
        resource.insert("owner".to_owned(), "payments".to_owned());

        let tags = merge_tags([&system, &resource]);
        assert_eq!(
            tags,
            vec![Tag::new("owner", "payments"), Tag::new("stack", "orders")]
        );
    }

    #[test]
    fn observed_fields_are_not_serialized_when_absent() {
        let model = DbInstanceModel {
            identifier: "orders-db".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&model).unwrap();
        assert!(!json.contains("endpoint_address"));
        assert!(!json.contains("arn"));
    }
}
