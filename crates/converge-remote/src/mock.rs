//! In-memory control plane.
//!
//! State is seeded from a [`MockFixture`] (JSON) and can be written back, so a
//! sequence of separate processes can drive one simulated control plane.
//! Instance statuses can be scripted: each describe call consumes the next
//! scripted status. Faults can be queued per action name.

use crate::api::{APPLY_IN_SYNC, APPLY_PENDING_REBOOT};
use crate::{
    ControlPlane, DbInstance, DbParameterGroup, EngineVersion, EngineVersionFilter,
    ModifyDbInstance, Parameter, ParameterGroupStatus, RemoteError, SecurityGroup,
    MAX_PARAMETERS_PER_REQUEST,
};
use converge_schema::{DbInstanceIdentifier, DbInstanceRole, ParameterGroupName, ResourceArn, Tag};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A fault the mock raises instead of performing an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MockFault {
    Service { code: String, message: String },
    Http { status: u16 },
    Transport { message: String },
}

impl MockFault {
    pub fn service(code: &str, message: &str) -> Self {
        MockFault::Service {
            code: code.to_owned(),
            message: message.to_owned(),
        }
    }

    fn into_error(self, action: &str) -> RemoteError {
        match self {
            MockFault::Service { code, message } => RemoteError::Service { code, message },
            MockFault::Http { status } => RemoteError::Http {
                status,
                url: format!("mock://{action}"),
            },
            MockFault::Transport { message } => RemoteError::Transport(message),
        }
    }
}

/// Serializable state of the mock control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockFixture {
    pub instances: BTreeMap<String, DbInstance>,
    /// Statuses reported by successive describe calls, per instance.
    pub status_scripts: BTreeMap<String, VecDeque<String>>,
    pub parameter_groups: BTreeMap<String, DbParameterGroup>,
    /// Current parameters per group name.
    pub group_parameters: BTreeMap<String, BTreeMap<String, Parameter>>,
    /// Engine default parameters per family.
    pub engine_defaults: BTreeMap<String, Vec<Parameter>>,
    pub engine_versions: Vec<EngineVersion>,
    pub security_groups: Vec<SecurityGroup>,
    /// Tags per resource ARN.
    pub tags: BTreeMap<String, BTreeMap<String, String>>,
    /// Faults raised by the next calls of an action, in order.
    pub faults: BTreeMap<String, VecDeque<MockFault>>,
    /// Completed calls per action.
    pub calls: BTreeMap<String, u32>,
    pub modify_requests: Vec<ModifyDbInstance>,
    /// Parameter names per modify call, in call order.
    pub modified_parameter_batches: Vec<Vec<String>>,
    pub reset_parameter_batches: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockFixture>,
}

fn not_found(code: &str, what: &str) -> RemoteError {
    RemoteError::service(code, format!("{what} not found"))
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: MockFixture) -> Self {
        Self {
            state: Mutex::new(fixture),
        }
    }

    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let content = std::fs::read_to_string(path)?;
        let fixture = serde_json::from_str(&content)
            .map_err(|e| RemoteError::Config(format!("invalid mock fixture: {e}")))?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        let content = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn snapshot(&self) -> MockFixture {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockFixture> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn insert_instance(&self, instance: DbInstance) {
        self.lock()
            .instances
            .insert(instance.identifier.to_string(), instance);
    }

    pub fn insert_parameter_group(&self, group: DbParameterGroup, parameters: Vec<Parameter>) {
        let mut state = self.lock();
        state.group_parameters.insert(
            group.name.to_string(),
            parameters.into_iter().map(|p| (p.name.clone(), p)).collect(),
        );
        state.parameter_groups.insert(group.name.to_string(), group);
    }

    pub fn set_engine_defaults(&self, family: &str, parameters: Vec<Parameter>) {
        self.lock()
            .engine_defaults
            .insert(family.to_owned(), parameters);
    }

    pub fn add_engine_version(&self, version: EngineVersion) {
        self.lock().engine_versions.push(version);
    }

    pub fn add_security_group(&self, group: SecurityGroup) {
        self.lock().security_groups.push(group);
    }

    pub fn set_tags(&self, arn: &str, tags: &[Tag]) {
        self.lock().tags.insert(
            arn.to_owned(),
            tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect(),
        );
    }

    pub fn script_statuses(&self, id: &str, statuses: &[&str]) {
        self.lock().status_scripts.insert(
            id.to_owned(),
            statuses.iter().map(|s| (*s).to_owned()).collect(),
        );
    }

    pub fn fail_next(&self, action: &str, fault: MockFault) {
        self.lock()
            .faults
            .entry(action.to_owned())
            .or_default()
            .push_back(fault);
    }

    pub fn calls(&self, action: &str) -> u32 {
        self.lock().calls.get(action).copied().unwrap_or(0)
    }

    pub fn instance(&self, id: &str) -> Option<DbInstance> {
        self.lock().instances.get(id).cloned()
    }

    pub fn tags(&self, arn: &str) -> BTreeMap<String, String> {
        self.lock().tags.get(arn).cloned().unwrap_or_default()
    }

    pub fn parameter_value(&self, group: &str, name: &str) -> Option<String> {
        self.lock()
            .group_parameters
            .get(group)
            .and_then(|params| params.get(name))
            .and_then(|p| p.value.clone())
    }

    /// Count the call and raise a queued fault, if any. Faulted calls still count.
    fn enter(&self, action: &str) -> Result<MutexGuard<'_, MockFixture>, RemoteError> {
        let mut state = self.lock();
        *state.calls.entry(action.to_owned()).or_insert(0) += 1;
        if let Some(fault) = state.faults.get_mut(action).and_then(VecDeque::pop_front) {
            tracing::debug!("mock {action}: injected fault");
            return Err(fault.into_error(action));
        }
        Ok(state)
    }
}

fn instance_mut<'s>(
    state: &'s mut MockFixture,
    id: &DbInstanceIdentifier,
) -> Result<&'s mut DbInstance, RemoteError> {
    state
        .instances
        .get_mut(id.as_str())
        .ok_or_else(|| not_found("DBInstanceNotFound", &format!("DB instance {id}")))
}

fn check_batch(parameters: &[Parameter]) -> Result<(), RemoteError> {
    if parameters.is_empty() || parameters.len() > MAX_PARAMETERS_PER_REQUEST {
        return Err(RemoteError::service(
            "InvalidParameterValue",
            format!(
                "between 1 and {MAX_PARAMETERS_PER_REQUEST} parameters per request, got {}",
                parameters.len()
            ),
        ));
    }
    Ok(())
}

impl ControlPlane for MockBackend {
    fn describe_db_instance(&self, id: &DbInstanceIdentifier) -> Result<DbInstance, RemoteError> {
        let mut state = self.enter("DescribeDBInstances")?;
        let next = state
            .status_scripts
            .get_mut(id.as_str())
            .and_then(VecDeque::pop_front);
        let instance = instance_mut(&mut state, id)?;
        if let Some(status) = next {
            instance.status = status;
        }
        Ok(instance.clone())
    }

    fn modify_db_instance(&self, request: &ModifyDbInstance) -> Result<DbInstance, RemoteError> {
        let mut state = self.enter("ModifyDBInstance")?;
        state.modify_requests.push(request.clone());
        let instance = instance_mut(&mut state, &request.identifier)?;
        if let Some(ref v) = request.engine_version {
            instance.engine_version.clone_from(v);
        }
        if let Some(ref c) = request.db_instance_class {
            instance.db_instance_class.clone_from(c);
        }
        if let Some(storage) = request.allocated_storage {
            instance.allocated_storage = storage;
        }
        if let Some(max) = request.max_allocated_storage {
            // Equal to allocated storage means autoscaling off.
            instance.max_allocated_storage = (max > instance.allocated_storage).then_some(max);
        }
        if let Some(ref groups) = request.vpc_security_group_ids {
            instance.vpc_security_groups.clone_from(groups);
        }
        if let Some(ref name) = request.db_parameter_group_name {
            let changed = instance.parameter_groups.first().map(|g| &g.name) != Some(name);
            if changed {
                instance.parameter_groups = vec![ParameterGroupStatus {
                    name: name.clone(),
                    apply_status: APPLY_PENDING_REBOOT.to_owned(),
                }];
            }
        }
        Ok(instance.clone())
    }

    fn reboot_db_instance(&self, id: &DbInstanceIdentifier) -> Result<DbInstance, RemoteError> {
        let mut state = self.enter("RebootDBInstance")?;
        let instance = instance_mut(&mut state, id)?;
        for group in &mut instance.parameter_groups {
            APPLY_IN_SYNC.clone_into(&mut group.apply_status);
        }
        Ok(instance.clone())
    }

    fn add_role_to_db_instance(
        &self,
        id: &DbInstanceIdentifier,
        role: &DbInstanceRole,
    ) -> Result<(), RemoteError> {
        let mut state = self.enter("AddRoleToDBInstance")?;
        let instance = instance_mut(&mut state, id)?;
        if instance.associated_roles.contains(role) {
            return Err(RemoteError::service(
                "DBInstanceRoleAlreadyExists",
                format!("role {} already associated", role.role_arn),
            ));
        }
        instance.associated_roles.push(role.clone());
        Ok(())
    }

    fn remove_role_from_db_instance(
        &self,
        id: &DbInstanceIdentifier,
        role: &DbInstanceRole,
    ) -> Result<(), RemoteError> {
        let mut state = self.enter("RemoveRoleFromDBInstance")?;
        let instance = instance_mut(&mut state, id)?;
        let before = instance.associated_roles.len();
        instance.associated_roles.retain(|r| r != role);
        if instance.associated_roles.len() == before {
            return Err(not_found(
                "DBInstanceRoleNotFound",
                &format!("role {}", role.role_arn),
            ));
        }
        Ok(())
    }

    fn add_tags(&self, arn: &ResourceArn, tags: &[Tag]) -> Result<(), RemoteError> {
        let mut state = self.enter("AddTagsToResource")?;
        let entry = state.tags.entry(arn.to_string()).or_default();
        for tag in tags {
            entry.insert(tag.key.clone(), tag.value.clone());
        }
        Ok(())
    }

    fn remove_tags(&self, arn: &ResourceArn, keys: &[String]) -> Result<(), RemoteError> {
        let mut state = self.enter("RemoveTagsFromResource")?;
        if let Some(entry) = state.tags.get_mut(arn.as_str()) {
            for key in keys {
                entry.remove(key);
            }
        }
        Ok(())
    }

    fn describe_db_parameter_groups(
        &self,
        name: &ParameterGroupName,
    ) -> Result<Vec<DbParameterGroup>, RemoteError> {
        let state = self.enter("DescribeDBParameterGroups")?;
        Ok(state
            .parameter_groups
            .get(name.as_str())
            .cloned()
            .into_iter()
            .collect())
    }

    fn describe_db_engine_versions(
        &self,
        filter: &EngineVersionFilter,
    ) -> Result<Vec<EngineVersion>, RemoteError> {
        let state = self.enter("DescribeDBEngineVersions")?;
        Ok(state
            .engine_versions
            .iter()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect())
    }

    fn describe_default_security_group(
        &self,
        vpc_id: &str,
    ) -> Result<Option<SecurityGroup>, RemoteError> {
        let state = self.enter("DescribeSecurityGroups")?;
        Ok(state
            .security_groups
            .iter()
            .find(|g| g.vpc_id == vpc_id && g.name == "default")
            .cloned())
    }

    fn describe_engine_default_parameters(
        &self,
        family: &str,
    ) -> Result<Vec<Parameter>, RemoteError> {
        let state = self.enter("DescribeEngineDefaultParameters")?;
        Ok(state.engine_defaults.get(family).cloned().unwrap_or_default())
    }

    fn describe_db_parameters(
        &self,
        name: &ParameterGroupName,
    ) -> Result<Vec<Parameter>, RemoteError> {
        let state = self.enter("DescribeDBParameters")?;
        state
            .group_parameters
            .get(name.as_str())
            .map(|params| params.values().cloned().collect())
            .ok_or_else(|| not_found("DBParameterGroupNotFound", &format!("parameter group {name}")))
    }

    fn modify_db_parameter_group(
        &self,
        name: &ParameterGroupName,
        parameters: &[Parameter],
    ) -> Result<(), RemoteError> {
        let mut state = self.enter("ModifyDBParameterGroup")?;
        check_batch(parameters)?;
        let group = state
            .group_parameters
            .get_mut(name.as_str())
            .ok_or_else(|| not_found("DBParameterGroupNotFound", &format!("parameter group {name}")))?;
        for p in parameters {
            group.insert(p.name.clone(), p.clone());
        }
        state
            .modified_parameter_batches
            .push(parameters.iter().map(|p| p.name.clone()).collect());
        Ok(())
    }

    fn reset_db_parameter_group(
        &self,
        name: &ParameterGroupName,
        parameters: &[Parameter],
    ) -> Result<(), RemoteError> {
        let mut state = self.enter("ResetDBParameterGroup")?;
        check_batch(parameters)?;
        let family = state
            .parameter_groups
            .get(name.as_str())
            .map(|g| g.family.clone())
            .ok_or_else(|| not_found("DBParameterGroupNotFound", &format!("parameter group {name}")))?;
        let defaults: BTreeMap<String, Option<String>> = state
            .engine_defaults
            .get(&family)
            .map(|params| params.iter().map(|p| (p.name.clone(), p.value.clone())).collect())
            .unwrap_or_default();
        if let Some(group) = state.group_parameters.get_mut(name.as_str()) {
            for p in parameters {
                if let Some(current) = group.get_mut(&p.name) {
                    current.value = defaults.get(&p.name).cloned().flatten();
                }
            }
        }
        state
            .reset_parameter_batches
            .push(parameters.iter().map(|p| p.name.clone()).collect());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> DbInstance {
        DbInstance {
            identifier: DbInstanceIdentifier::new("orders"),
            status: "available".to_owned(),
            arn: ResourceArn::new("arn:db:orders"),
            engine: "mysql".to_owned(),
            allocated_storage: 100,
            ..DbInstance::default()
        }
    }

    #[test]
    fn scripted_statuses_are_consumed_in_order() {
        let mock = MockBackend::new();
        mock.insert_instance(orders());
        mock.script_statuses("orders", &["modifying", "available"]);
        let id = DbInstanceIdentifier::new("orders");
        assert_eq!(mock.describe_db_instance(&id).unwrap().status, "modifying");
        assert_eq!(mock.describe_db_instance(&id).unwrap().status, "available");
        assert_eq!(mock.describe_db_instance(&id).unwrap().status, "available");
        assert_eq!(mock.calls("DescribeDBInstances"), 3);
    }

    #[test]
    fn missing_instance_is_not_found() {
        let mock = MockBackend::new();
        let err = mock
            .describe_db_instance(&DbInstanceIdentifier::new("ghost"))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Service { ref code, .. } if code == "DBInstanceNotFound"));
    }

    #[test]
    fn injected_faults_fire_once_and_count() {
        let mock = MockBackend::new();
        mock.insert_instance(orders());
        mock.fail_next("ModifyDBInstance", MockFault::service("Throttling", "slow down"));
        let req = ModifyDbInstance {
            identifier: DbInstanceIdentifier::new("orders"),
            db_instance_class: Some("db.r6g.large".to_owned()),
            ..ModifyDbInstance::default()
        };
        assert!(mock.modify_db_instance(&req).is_err());
        assert!(mock.modify_db_instance(&req).is_ok());
        assert_eq!(mock.calls("ModifyDBInstance"), 2);
        assert_eq!(mock.snapshot().modify_requests.len(), 1);
    }

    #[test]
    fn parameter_group_change_waits_for_reboot() {
        let mock = MockBackend::new();
        mock.insert_instance(orders());
        let id = DbInstanceIdentifier::new("orders");
        mock.modify_db_instance(&ModifyDbInstance {
            identifier: id.clone(),
            db_parameter_group_name: Some(ParameterGroupName::new("orders-params")),
            ..ModifyDbInstance::default()
        })
        .unwrap();
        assert!(mock.instance("orders").unwrap().is_pending_reboot());
        mock.reboot_db_instance(&id).unwrap();
        assert!(!mock.instance("orders").unwrap().is_pending_reboot());
    }

    #[test]
    fn batches_over_the_limit_are_rejected() {
        let mock = MockBackend::new();
        mock.insert_parameter_group(
            DbParameterGroup {
                name: ParameterGroupName::new("g"),
                family: "mysql8.0".to_owned(),
                description: String::new(),
                arn: ResourceArn::new("arn:pg:g"),
            },
            Vec::new(),
        );
        let params: Vec<Parameter> = (0..21)
            .map(|i| Parameter::new(&format!("p{i}"), Some("1"), true))
            .collect();
        let err = mock
            .modify_db_parameter_group(&ParameterGroupName::new("g"), &params)
            .unwrap_err();
        assert!(matches!(err, RemoteError::Service { ref code, .. } if code == "InvalidParameterValue"));
    }

    #[test]
    fn reset_restores_engine_default() {
        let mock = MockBackend::new();
        mock.set_engine_defaults("mysql8.0", vec![Parameter::new("max_connections", Some("151"), true)]);
        mock.insert_parameter_group(
            DbParameterGroup {
                name: ParameterGroupName::new("g"),
                family: "mysql8.0".to_owned(),
                description: String::new(),
                arn: ResourceArn::new("arn:pg:g"),
            },
            vec![Parameter::new("max_connections", Some("500"), true)],
        );
        let name = ParameterGroupName::new("g");
        mock.reset_db_parameter_group(&name, &[Parameter::new("max_connections", None, true)])
            .unwrap();
        assert_eq!(mock.parameter_value("g", "max_connections").as_deref(), Some("151"));
    }

    #[test]
    fn tags_add_and_remove() {
        let mock = MockBackend::new();
        let arn = ResourceArn::new("arn:db:orders");
        mock.add_tags(&arn, &[Tag::new("team", "payments"), Tag::new("env", "prod")])
            .unwrap();
        mock.remove_tags(&arn, &["env".to_owned()]).unwrap();
        assert_eq!(
            mock.tags("arn:db:orders"),
            BTreeMap::from([("team".to_owned(), "payments".to_owned())])
        );
    }

    #[test]
    fn fixture_roundtrip_preserves_scripts_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mock.json");
        let mock = MockBackend::new();
        mock.insert_instance(orders());
        mock.script_statuses("orders", &["modifying", "available"]);
        mock.describe_db_instance(&DbInstanceIdentifier::new("orders"))
            .unwrap();
        mock.save(&path).unwrap();

        let reloaded = MockBackend::load(&path).unwrap();
        assert_eq!(reloaded.calls("DescribeDBInstances"), 1);
        let next = reloaded
            .describe_db_instance(&DbInstanceIdentifier::new("orders"))
            .unwrap();
        assert_eq!(next.status, "available");
    }
}
