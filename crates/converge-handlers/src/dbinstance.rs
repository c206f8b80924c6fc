//! Update reconciler for a database instance.

use crate::rules;
use crate::{apply_tag_changes, remote_fault, tag_changes};
use converge_core::{
    handle_fault, ErrorRuleSet, EventSink, ExhaustionPolicy, Fault, HandlerConfig, Pipeline,
    Probe, ProgressEvent, ResourceHandler,
};
use converge_remote::{ControlPlane, EngineVersionFilter, ModifyDbInstance};
use converge_schema::{DbInstanceModel, DbInstanceRole, ErrorStatus, HandlerErrorCode, Tag};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const UPDATE_AVAILABLE_PROBE: &str = "update-db-instance-available";
const REBOOT_AVAILABLE_PROBE: &str = "reboot-db-instance-available";
const REBOOT_ISSUED: &str = "reboot-issued";

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub desired: DbInstanceModel,
    /// Last applied state; `None` when nothing is known about it.
    pub previous: Option<DbInstanceModel>,
    pub desired_tags: Vec<Tag>,
    pub previous_tags: Vec<Tag>,
    /// The update reverts a failed one.
    pub rollback: bool,
}

pub struct DbInstanceUpdateHandler<'c> {
    client: &'c dyn ControlPlane,
    config: HandlerConfig,
    overrides: Option<ErrorRuleSet>,
}

impl<'c> DbInstanceUpdateHandler<'c> {
    pub fn new(client: &'c dyn ControlPlane, config: HandlerConfig) -> Self {
        Self {
            client,
            config,
            overrides: None,
        }
    }

    /// Rules consulted before every built-in table.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ErrorRuleSet) -> Self {
        self.overrides = Some(overrides);
        self
    }

    fn table(&self, base: Arc<ErrorRuleSet>) -> Arc<ErrorRuleSet> {
        rules::with_overrides(self.overrides.as_ref(), base)
    }

    fn set_parameter_group_name(
        &self,
        mut progress: ProgressEvent<DbInstanceModel>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        let Some(name) = progress.resource_model.db_parameter_group_name.clone() else {
            return progress;
        };
        let groups = match self.client.describe_db_parameter_groups(&name) {
            Ok(groups) => groups,
            Err(e) => return remote_fault(progress, e, rules, sink),
        };
        let Some(group) = groups.into_iter().next() else {
            return progress;
        };
        let filter = EngineVersionFilter {
            family: Some(group.family),
            engine: progress.resource_model.engine.clone(),
            engine_version: progress.resource_model.engine_version.clone(),
        };
        match self.client.describe_db_engine_versions(&filter) {
            Ok(versions) if versions.is_empty() => {
                info!(group = %name, "parameter group does not fit the rolled back engine version, dropping it");
                progress.resource_model.db_parameter_group_name = None;
                progress
            }
            Ok(_) => progress,
            Err(e) => remote_fault(progress, e, rules, sink),
        }
    }

    fn set_default_vpc_security_group(
        &self,
        mut progress: ProgressEvent<DbInstanceModel>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        let live = match self
            .client
            .describe_db_instance(&progress.resource_model.identifier)
        {
            Ok(live) => live,
            Err(e) => return remote_fault(progress, e, rules, sink),
        };
        let Some(vpc_id) = live.vpc_id else {
            return progress;
        };
        match self.client.describe_default_security_group(&vpc_id) {
            Ok(Some(group)) => {
                debug!(vpc = %vpc_id, group = %group.id, "using default VPC security group");
                progress.resource_model.vpc_security_groups = vec![group.id];
                progress
            }
            Ok(None) => progress,
            Err(e) => remote_fault(progress, e, rules, sink),
        }
    }

    /// Autoscaling is switched off by setting the ceiling to the allocated size.
    fn unset_max_allocated_storage(
        &self,
        mut progress: ProgressEvent<DbInstanceModel>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        match self
            .client
            .describe_db_instance(&progress.resource_model.identifier)
        {
            Ok(live) => {
                progress.resource_model.max_allocated_storage = Some(live.allocated_storage);
                progress
            }
            Err(e) => remote_fault(progress, e, rules, sink),
        }
    }

    fn ensure_engine_set(
        &self,
        mut progress: ProgressEvent<DbInstanceModel>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        if progress.resource_model.engine.is_some() {
            return progress;
        }
        match self
            .client
            .describe_db_instance(&progress.resource_model.identifier)
        {
            Ok(live) => {
                progress.resource_model.engine = Some(live.engine);
                progress
            }
            Err(e) => remote_fault(progress, e, rules, sink),
        }
    }

    fn modify(
        &self,
        progress: ProgressEvent<DbInstanceModel>,
        request: &UpdateRequest,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        let modify = modify_request(
            request.previous.as_ref(),
            &progress.resource_model,
            request.rollback,
        );
        if modify.is_empty() {
            debug!(instance = %modify.identifier, "nothing to modify");
            return progress;
        }
        info!(
            instance = %modify.identifier,
            major_upgrade = modify.allow_major_version_upgrade,
            "modifying DB instance"
        );
        match self.client.modify_db_instance(&modify) {
            Ok(_) => progress,
            Err(e) => remote_fault(progress, e, rules, sink),
        }
    }

    fn reboot_if_pending(
        &self,
        mut progress: ProgressEvent<DbInstanceModel>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        let id = progress.resource_model.identifier.clone();
        let live = match self.client.describe_db_instance(&id) {
            Ok(live) => live,
            Err(e) => {
                let fault = Fault::from(e);
                if rules.find(&fault) == Some(ErrorStatus::FailWith(HandlerErrorCode::NotFound)) {
                    debug!(instance = %id, "instance not found, skipping reboot");
                    return progress;
                }
                return handle_fault(progress, &fault, rules, sink);
            }
        };
        if !live.is_pending_reboot() {
            return progress;
        }
        info!(instance = %id, "rebooting to apply parameter group");
        match self.client.reboot_db_instance(&id) {
            Ok(_) => {
                progress.callback_context.mark_done(REBOOT_ISSUED);
                progress
            }
            Err(e) => remote_fault(progress, e, rules, sink),
        }
    }

    fn update_associated_roles(
        &self,
        mut progress: ProgressEvent<DbInstanceModel>,
        previous: &[DbInstanceRole],
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        let before: BTreeSet<&DbInstanceRole> = previous.iter().collect();
        let desired = progress.resource_model.associated_roles.clone();
        let after: BTreeSet<&DbInstanceRole> = desired.iter().collect();
        let id = progress.resource_model.identifier.clone();

        for role in before.difference(&after) {
            debug!(instance = %id, role = %role.role_arn, "removing role");
            if let Err(e) = self.client.remove_role_from_db_instance(&id, role) {
                progress = remote_fault(progress, e, rules, sink);
                if !progress.can_continue() {
                    return progress;
                }
            }
        }
        for role in after.difference(&before) {
            debug!(instance = %id, role = %role.role_arn, "adding role");
            if let Err(e) = self.client.add_role_to_db_instance(&id, role) {
                progress = remote_fault(progress, e, rules, sink);
                if !progress.can_continue() {
                    return progress;
                }
            }
        }
        progress
    }

    fn update_tags(
        &self,
        progress: ProgressEvent<DbInstanceModel>,
        request: &UpdateRequest,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        let changes = tag_changes(&request.previous_tags, &request.desired_tags);
        if changes.is_empty() {
            return progress;
        }
        let arn = match self
            .client
            .describe_db_instance(&progress.resource_model.identifier)
        {
            Ok(live) => live.arn,
            Err(e) => return remote_fault(progress, e, rules, sink),
        };
        apply_tag_changes(self.client, &arn, &changes, progress, rules, sink)
    }

    fn read(
        &self,
        mut progress: ProgressEvent<DbInstanceModel>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        match self
            .client
            .describe_db_instance(&progress.resource_model.identifier)
        {
            Ok(live) => {
                let model = &mut progress.resource_model;
                model.arn = Some(live.arn);
                if let Some(endpoint) = live.endpoint {
                    model.endpoint_address = Some(endpoint.address);
                    model.endpoint_port = Some(endpoint.port);
                }
                ProgressEvent::success(progress.resource_model, progress.callback_context)
            }
            Err(e) => remote_fault(progress, e, rules, sink),
        }
    }

    fn available_probe(&self, name: &str) -> Probe {
        Probe::from_config(name, &self.config)
    }

    fn is_available(&self, model: &DbInstanceModel) -> Result<bool, Fault> {
        self.client
            .describe_db_instance(&model.identifier)
            .map(|live| live.is_available())
            .map_err(Fault::from)
    }
}

impl ResourceHandler for DbInstanceUpdateHandler<'_> {
    type Request = UpdateRequest;
    type Model = DbInstanceModel;

    fn kind(&self) -> &'static str {
        "db-instance"
    }

    fn initial_model(&self, request: &UpdateRequest) -> DbInstanceModel {
        request.desired.clone()
    }

    fn handle(
        &self,
        request: &UpdateRequest,
        progress: ProgressEvent<DbInstanceModel>,
        sink: &dyn EventSink,
    ) -> ProgressEvent<DbInstanceModel> {
        let default_rules = self.table(rules::default_db_instance());
        let modify_rules = self.table(rules::modify_db_instance());
        let role_rules = self.table(rules::update_associated_roles());
        let previous = request.previous.as_ref();
        let previous_roles = previous.map_or(&[][..], |m| m.associated_roles.as_slice());

        let update_probe = self.available_probe(UPDATE_AVAILABLE_PROBE);
        let reboot_probe = self
            .available_probe(REBOOT_AVAILABLE_PROBE)
            .on_exhausted(ExhaustionPolicy::Accept);

        let pipeline = Pipeline::new(sink)
            .step("check-immutable", |p| match immutable_change(previous, &p.resource_model) {
                Some(field) => {
                    warn!(field, "attempt to change an immutable attribute");
                    ProgressEvent::failed(
                        p.resource_model,
                        p.callback_context,
                        HandlerErrorCode::NotUpdatable,
                        "Resource is immutable",
                    )
                }
                None => p,
            })
            .step_if(
                "set-parameter-group-name",
                |_| should_set_parameter_group_name(request),
                |p| self.set_parameter_group_name(p, &default_rules, sink),
            )
            .step_if(
                "set-default-vpc-security-group",
                |_| request.desired.vpc_security_groups.is_empty(),
                |p| self.set_default_vpc_security_group(p, &default_rules, sink),
            )
            .step_if(
                "unset-max-allocated-storage",
                |_| {
                    previous.is_some_and(|m| m.max_allocated_storage.is_some())
                        && request.desired.max_allocated_storage.is_none()
                },
                |p| self.unset_max_allocated_storage(p, &modify_rules, sink),
            )
            .step("ensure-engine-set", |p| {
                self.ensure_engine_set(p, &default_rules, sink)
            })
            .once("updated", |p| self.modify(p, request, &modify_rules, sink))
            .step(UPDATE_AVAILABLE_PROBE, |p| {
                update_probe.wait(p, &default_rules, sink, |m| self.is_available(m))
            })
            .once("rebooted", |p| self.reboot_if_pending(p, &default_rules, sink))
            .step_if(
                REBOOT_AVAILABLE_PROBE,
                |p| p.callback_context.is_done(REBOOT_ISSUED),
                |p| reboot_probe.wait(p, &default_rules, sink, |m| self.is_available(m)),
            )
            .once("updated-roles", |p| {
                self.update_associated_roles(p, previous_roles, &role_rules, sink)
            })
            .step("update-tags", |p| {
                self.update_tags(p, request, &default_rules, sink)
            })
            .step("read", |p| self.read(p, &default_rules, sink));
        pipeline.run(progress)
    }
}

fn should_set_parameter_group_name(request: &UpdateRequest) -> bool {
    let Some(previous) = request.previous.as_ref() else {
        return false;
    };
    request.rollback
        && request.desired.db_parameter_group_name != previous.db_parameter_group_name
        && request.desired.engine_version != previous.engine_version
}

/// Engine changes the control plane performs in place. Any other change of
/// engine requires replacing the instance.
const IN_PLACE_ENGINE_CHANGES: &[(&str, &str)] = &[
    ("aurora", "aurora-mysql"),
    ("oracle-se", "oracle-se2"),
    ("oracle-se1", "oracle-se2"),
    ("oracle-ee", "oracle-se2"),
];

fn is_engine_change_mutable(before: &str, after: &str) -> bool {
    before.eq_ignore_ascii_case(after)
        || IN_PLACE_ENGINE_CHANGES.iter().any(|(from, to)| {
            before.eq_ignore_ascii_case(from) && after.eq_ignore_ascii_case(to)
        })
}

/// Name of the first attribute that cannot change in place, if any.
fn immutable_change(
    previous: Option<&DbInstanceModel>,
    desired: &DbInstanceModel,
) -> Option<&'static str> {
    let previous = previous?;
    if previous.identifier != desired.identifier {
        return Some("identifier");
    }
    if let (Some(before), Some(after)) = (&previous.engine, &desired.engine) {
        if !is_engine_change_mutable(before, after) {
            return Some("engine");
        }
    }
    if previous.storage_encrypted != desired.storage_encrypted {
        return Some("storage_encrypted");
    }
    if previous.kms_key_id != desired.kms_key_id {
        return Some("kms_key_id");
    }
    if previous.character_set_name != desired.character_set_name {
        return Some("character_set_name");
    }
    None
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Build the modify call for moving from `previous` to `desired`.
///
/// Only attributes that differ are sent. A rollback never shrinks storage,
/// since allocated storage cannot be reduced in place.
pub fn modify_request(
    previous: Option<&DbInstanceModel>,
    desired: &DbInstanceModel,
    rollback: bool,
) -> ModifyDbInstance {
    let base = previous.cloned().unwrap_or_default();
    let changed = |before: &Option<String>, after: &Option<String>| {
        if before == after {
            None
        } else {
            after.clone()
        }
    };

    let allocated_storage = match (base.allocated_storage, desired.allocated_storage) {
        (before, after) if before == after => None,
        (Some(before), Some(after)) if rollback && after < before => None,
        (_, after) => after,
    };
    let vpc_security_group_ids = (base.vpc_security_groups != desired.vpc_security_groups
        && !desired.vpc_security_groups.is_empty())
    .then(|| desired.vpc_security_groups.clone());
    let allow_major_version_upgrade = match (&base.engine_version, &desired.engine_version) {
        (Some(before), Some(after)) => major_version(before) != major_version(after),
        _ => false,
    };

    ModifyDbInstance {
        identifier: desired.identifier.clone(),
        engine_version: changed(&base.engine_version, &desired.engine_version),
        db_instance_class: changed(&base.db_instance_class, &desired.db_instance_class),
        db_parameter_group_name: if base.db_parameter_group_name == desired.db_parameter_group_name {
            None
        } else {
            desired.db_parameter_group_name.clone()
        },
        allocated_storage,
        max_allocated_storage: if base.max_allocated_storage == desired.max_allocated_storage {
            None
        } else {
            desired.max_allocated_storage
        },
        vpc_security_group_ids,
        allow_major_version_upgrade,
        apply_immediately: true,
    }
}
