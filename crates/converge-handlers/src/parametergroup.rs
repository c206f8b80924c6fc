//! Update reconciler for a DB parameter group.
//!
//! Parameters are applied in a single exactly-once step: engine defaults and
//! the group's current parameters are fetched, the desired parameters are
//! validated against the defaults, then stale values are reset and changed
//! values written, both in batches the control plane accepts.

use crate::rules;
use crate::{apply_tag_changes, remote_fault, tag_changes};
use converge_core::{ErrorRuleSet, EventSink, Pipeline, ProgressEvent, ResourceHandler};
use converge_remote::{ControlPlane, Parameter, MAX_PARAMETERS_PER_REQUEST};
use converge_schema::{HandlerErrorCode, ParameterGroupModel, Tag};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct ParameterGroupRequest {
    pub desired: ParameterGroupModel,
    pub desired_tags: Vec<Tag>,
    pub previous_tags: Vec<Tag>,
}

/// What the parameter steps thread between each other.
#[derive(Debug, Clone, Default)]
struct ParameterWork {
    model: ParameterGroupModel,
    defaults: BTreeMap<String, Parameter>,
    current: BTreeMap<String, Parameter>,
}

impl ParameterWork {
    fn new(model: ParameterGroupModel) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    /// First desired parameter that is unknown to the engine, or unmodifiable
    /// with a value other than the default.
    fn first_invalid(&self) -> Option<&str> {
        self.model
            .parameters
            .iter()
            .find(|(name, value)| match self.defaults.get(*name) {
                None => true,
                Some(default) => {
                    !default.is_modifiable
                        && default.value.as_deref() != Some(value.to_string().as_str())
                }
            })
            .map(|(name, _)| name.as_str())
    }

    /// Current values not mentioned in the model that differ from the default.
    fn to_reset(&self) -> Vec<Parameter> {
        self.current
            .values()
            .filter(|p| {
                let Some(current) = p.value.as_deref() else {
                    return false;
                };
                let default = self.defaults.get(&p.name).and_then(|d| d.value.as_deref());
                !self.model.parameters.contains_key(&p.name) && Some(current) != default
            })
            .cloned()
            .collect()
    }

    /// Desired values that differ from the group's current ones.
    fn to_modify(&self) -> Vec<Parameter> {
        self.model
            .parameters
            .iter()
            .filter_map(|(name, value)| {
                let current = self.current.get(name)?;
                let wanted = value.to_string();
                (current.value.as_deref() != Some(wanted.as_str()))
                    .then(|| current.with_value(&wanted))
            })
            .collect()
    }
}

fn names(batch: &[Parameter]) -> String {
    batch
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct ParameterGroupUpdateHandler<'c> {
    client: &'c dyn ControlPlane,
    overrides: Option<ErrorRuleSet>,
}

impl<'c> ParameterGroupUpdateHandler<'c> {
    pub fn new(client: &'c dyn ControlPlane) -> Self {
        Self {
            client,
            overrides: None,
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ErrorRuleSet) -> Self {
        self.overrides = Some(overrides);
        self
    }

    fn table(&self, base: Arc<ErrorRuleSet>) -> Arc<ErrorRuleSet> {
        rules::with_overrides(self.overrides.as_ref(), base)
    }

    fn apply_parameters(
        &self,
        progress: ProgressEvent<ParameterGroupModel>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<ParameterGroupModel> {
        let work = progress.map_model(ParameterWork::new);
        let pipeline = Pipeline::new(sink)
            .step("describe-engine-defaults", |mut p: ProgressEvent<ParameterWork>| {
                match self
                    .client
                    .describe_engine_default_parameters(&p.resource_model.model.family)
                {
                    Ok(defaults) => {
                        p.resource_model.defaults =
                            defaults.into_iter().map(|d| (d.name.clone(), d)).collect();
                        p
                    }
                    Err(e) => remote_fault(p, e, rules, sink),
                }
            })
            .step("validate-parameters", |p| {
                let Some(invalid) = p.resource_model.first_invalid().map(str::to_owned) else {
                    return p;
                };
                info!(group = %p.resource_model.model.name, parameter = %invalid, "invalid parameter");
                ProgressEvent::failed(
                    p.resource_model,
                    p.callback_context,
                    HandlerErrorCode::InvalidRequest,
                    format!("Invalid / unmodifiable / Unsupported DB Parameter: {invalid}"),
                )
            })
            .step("describe-current-parameters", |mut p| {
                match self.client.describe_db_parameters(&p.resource_model.model.name) {
                    Ok(current) => {
                        p.resource_model.current =
                            current.into_iter().map(|c| (c.name.clone(), c)).collect();
                        p
                    }
                    Err(e) => remote_fault(p, e, rules, sink),
                }
            })
            .step("reset-parameters", |p| {
                let batch = p.resource_model.to_reset();
                self.send_batches(p, &batch, Action::Reset, rules, sink)
            })
            .step("modify-parameters", |p| {
                let batch = p.resource_model.to_modify();
                self.send_batches(p, &batch, Action::Modify, rules, sink)
            });
        pipeline.run(work).map_model(|w| w.model)
    }

    fn send_batches(
        &self,
        mut progress: ProgressEvent<ParameterWork>,
        parameters: &[Parameter],
        action: Action,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<ParameterWork> {
        let group = progress.resource_model.model.name.clone();
        for batch in parameters.chunks(MAX_PARAMETERS_PER_REQUEST) {
            let result = match action {
                Action::Reset => {
                    info!(%group, total = batch.len(), "Reset parameters: {}", names(batch));
                    self.client.reset_db_parameter_group(&group, batch)
                }
                Action::Modify => {
                    info!(%group, total = batch.len(), "Modifying parameters: {}", names(batch));
                    self.client.modify_db_parameter_group(&group, batch)
                }
            };
            if let Err(e) = result {
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
        progress: ProgressEvent<ParameterGroupModel>,
        request: &ParameterGroupRequest,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<ParameterGroupModel> {
        let changes = tag_changes(&request.previous_tags, &request.desired_tags);
        if changes.is_empty() {
            return progress;
        }
        let group = match self
            .client
            .describe_db_parameter_groups(&progress.resource_model.name)
        {
            Ok(groups) => groups.into_iter().next(),
            Err(e) => return remote_fault(progress, e, rules, sink),
        };
        match group {
            Some(group) => apply_tag_changes(self.client, &group.arn, &changes, progress, rules, sink),
            None => {
                debug!(group = %progress.resource_model.name, "group vanished before tagging");
                progress
            }
        }
    }

    fn read(
        &self,
        mut progress: ProgressEvent<ParameterGroupModel>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
    ) -> ProgressEvent<ParameterGroupModel> {
        let name = progress.resource_model.name.clone();
        match self.client.describe_db_parameter_groups(&name) {
            Ok(groups) => match groups.into_iter().next() {
                Some(group) => {
                    progress.resource_model.arn = Some(group.arn);
                    ProgressEvent::success(progress.resource_model, progress.callback_context)
                }
                None => ProgressEvent::failed(
                    progress.resource_model,
                    progress.callback_context,
                    HandlerErrorCode::NotFound,
                    format!("DB parameter group {name} not found"),
                ),
            },
            Err(e) => remote_fault(progress, e, rules, sink),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Reset,
    Modify,
}

impl ResourceHandler for ParameterGroupUpdateHandler<'_> {
    type Request = ParameterGroupRequest;
    type Model = ParameterGroupModel;

    fn kind(&self) -> &'static str {
        "db-parameter-group"
    }

    fn initial_model(&self, request: &ParameterGroupRequest) -> ParameterGroupModel {
        request.desired.clone()
    }

    fn handle(
        &self,
        request: &ParameterGroupRequest,
        progress: ProgressEvent<ParameterGroupModel>,
        sink: &dyn EventSink,
    ) -> ProgressEvent<ParameterGroupModel> {
        let group_rules = self.table(rules::default_db_parameter_group());
        let tag_rules = self.table(rules::soft_fail_tag_db_parameter_group());

        let pipeline = Pipeline::new(sink)
            .once("parameters-applied", |p| {
                self.apply_parameters(p, &group_rules, sink)
            })
            .step("update-tags", |p| {
                self.update_tags(p, request, &tag_rules, sink)
            })
            .step("read", |p| self.read(p, &group_rules, sink));
        pipeline.run(progress)
    }
}
