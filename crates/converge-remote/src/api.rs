//! Request and response shapes exchanged with the control plane.

use converge_schema::{DbInstanceIdentifier, DbInstanceRole, ParameterGroupName, ResourceArn};
use serde::{Deserialize, Serialize};

pub const STATUS_AVAILABLE: &str = "available";
pub const APPLY_PENDING_REBOOT: &str = "pending-reboot";
pub const APPLY_IN_SYNC: &str = "in-sync";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInstance {
    pub identifier: DbInstanceIdentifier,
    pub status: String,
    pub arn: ResourceArn,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub engine_version: String,
    #[serde(default)]
    pub db_instance_class: String,
    #[serde(default)]
    pub allocated_storage: u32,
    #[serde(default)]
    pub max_allocated_storage: Option<u32>,
    #[serde(default)]
    pub storage_encrypted: bool,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(default)]
    pub character_set_name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    /// VPC of the instance's subnet group.
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub vpc_security_groups: Vec<String>,
    #[serde(default)]
    pub parameter_groups: Vec<ParameterGroupStatus>,
    #[serde(default)]
    pub associated_roles: Vec<DbInstanceRole>,
}

impl DbInstance {
    pub fn is_available(&self) -> bool {
        self.status == STATUS_AVAILABLE
    }

    /// Whether the first attached parameter group waits for a reboot.
    pub fn is_pending_reboot(&self) -> bool {
        self.parameter_groups
            .first()
            .is_some_and(|g| g.apply_status == APPLY_PENDING_REBOOT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterGroupStatus {
    pub name: ParameterGroupName,
    pub apply_status: String,
}

/// Fields of a modify call. `None` leaves the attribute untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyDbInstance {
    pub identifier: DbInstanceIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_instance_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_parameter_group_name: Option<ParameterGroupName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_storage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allocated_storage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_security_group_ids: Option<Vec<String>>,
    #[serde(default)]
    pub allow_major_version_upgrade: bool,
    #[serde(default)]
    pub apply_immediately: bool,
}

impl ModifyDbInstance {
    /// True when the call would change nothing.
    pub fn is_empty(&self) -> bool {
        self.engine_version.is_none()
            && self.db_instance_class.is_none()
            && self.db_parameter_group_name.is_none()
            && self.allocated_storage.is_none()
            && self.max_allocated_storage.is_none()
            && self.vpc_security_group_ids.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbParameterGroup {
    pub name: ParameterGroupName,
    pub family: String,
    #[serde(default)]
    pub description: String,
    pub arn: ResourceArn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    pub engine: String,
    pub engine_version: String,
    pub family: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

impl EngineVersionFilter {
    pub fn matches(&self, version: &EngineVersion) -> bool {
        let field = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        field(&self.family, &version.family)
            && field(&self.engine, &version.engine)
            && field(&self.engine_version, &version.engine_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub vpc_id: String,
}

/// One database parameter as the control plane reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default = "default_modifiable")]
    pub is_modifiable: bool,
    /// `immediate` or `pending-reboot`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_method: Option<String>,
}

fn default_modifiable() -> bool {
    true
}

impl Parameter {
    pub fn new(name: &str, value: Option<&str>, is_modifiable: bool) -> Self {
        Self {
            name: name.to_owned(),
            value: value.map(str::to_owned),
            is_modifiable,
            apply_method: None,
        }
    }

    /// The same parameter carrying `value`, keeping the other attributes.
    #[must_use]
    pub fn with_value(&self, value: &str) -> Self {
        Self {
            value: Some(value.to_owned()),
            ..self.clone()
        }
    }
}

/// One page of a paginated parameter listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterPage {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}
