//! Start or resume the logical operation for the resource a manifest names.

use super::{colorize_status, json_pretty, spinner, state_err, EXIT_SUCCESS};
use crate::backend::Backend;
use crate::shutdown::{install_signal_handler, shutdown_requested};
use crate::state::{OperationRecord, StateStore};
use converge_core::{
    invoke, load_overrides, validate_transition, CallbackContext, ErrorRuleSet, HandlerConfig,
    InvocationOutcome, OperationStatus, ResourceHandler, TracingSink,
};
use converge_handlers::{
    DbInstanceUpdateHandler, ParameterGroupRequest, ParameterGroupUpdateHandler, UpdateRequest,
};
use converge_remote::ControlPlane;
use converge_schema::{
    merge_tags, parse_manifest_file, DesiredResource, ManifestError, ManifestV1, Tag,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub struct ReconcileOptions {
    pub desired: PathBuf,
    pub previous: Option<PathBuf>,
    pub rollback: bool,
    pub watch: bool,
    pub error_rules: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub endpoint: Option<String>,
}

/// What a handler is asked to do, independent of the backend.
enum Plan {
    DbInstance(UpdateRequest),
    DbParameterGroup(ParameterGroupRequest),
}

struct Invocation {
    outcome: InvocationOutcome,
    context: CallbackContext,
    model: serde_json::Value,
}

#[derive(Serialize)]
struct Report<'a> {
    resource: &'a str,
    op_id: &'a str,
    invocations: u32,
    #[serde(flatten)]
    outcome: &'a InvocationOutcome,
    model: &'a serde_json::Value,
}

fn load_manifest(path: &Path) -> Result<(ManifestV1, DesiredResource), String> {
    let manifest = parse_manifest_file(path)
        .map_err(|e| format!("manifest error: {}: {e}", path.display()))?;
    let resource = manifest
        .resource()
        .map_err(|e| format!("manifest error: {}: {e}", path.display()))?;
    Ok((manifest, resource))
}

fn tags(manifest: &ManifestV1) -> Vec<Tag> {
    merge_tags([&manifest.system_tags, &manifest.tags])
}

fn plan(
    desired: (ManifestV1, DesiredResource),
    previous: Option<(ManifestV1, DesiredResource)>,
    rollback: bool,
) -> Result<Plan, String> {
    let (desired_manifest, desired) = desired;
    if let Some((_, ref prev)) = previous {
        if prev.key() != desired.key() {
            let err = ManifestError::ResourceMismatch {
                expected: prev.key(),
                found: desired.key(),
            };
            return Err(format!("manifest error: {err}"));
        }
    }
    let desired_tags = tags(&desired_manifest);
    let (previous_tags, previous) = match previous {
        Some((m, r)) => (tags(&m), Some(r)),
        None => (Vec::new(), None),
    };
    match desired {
        DesiredResource::DbInstance(model) => Ok(Plan::DbInstance(UpdateRequest {
            desired: model,
            previous: match previous {
                Some(DesiredResource::DbInstance(prev)) => Some(prev),
                _ => None,
            },
            desired_tags,
            previous_tags,
            rollback,
        })),
        DesiredResource::DbParameterGroup(model) => {
            Ok(Plan::DbParameterGroup(ParameterGroupRequest {
                desired: model,
                desired_tags,
                previous_tags,
            }))
        }
    }
}

fn run_handler<H>(
    handler: &H,
    request: &H::Request,
    context: Option<CallbackContext>,
) -> Result<Invocation, String>
where
    H: ResourceHandler,
    H::Model: Serialize,
{
    let result = invoke(handler, request, context, &TracingSink);
    let model = serde_json::to_value(&result.resource_model)
        .map_err(|e| format!("failed to serialize model: {e}"))?;
    Ok(Invocation {
        outcome: result.outcome(),
        context: result.callback_context,
        model,
    })
}

fn invoke_once(
    client: &dyn ControlPlane,
    plan: &Plan,
    config: &HandlerConfig,
    overrides: Option<&ErrorRuleSet>,
    context: Option<CallbackContext>,
) -> Result<Invocation, String> {
    match plan {
        Plan::DbInstance(request) => {
            let mut handler = DbInstanceUpdateHandler::new(client, config.clone());
            if let Some(rules) = overrides {
                handler = handler.with_overrides(rules.clone());
            }
            run_handler(&handler, request, context)
        }
        Plan::DbParameterGroup(request) => {
            let mut handler = ParameterGroupUpdateHandler::new(client);
            if let Some(rules) = overrides {
                handler = handler.with_overrides(rules.clone());
            }
            run_handler(&handler, request, context)
        }
    }
}

fn print_report(
    record: &OperationRecord,
    invocation: &Invocation,
    json: bool,
) -> Result<(), String> {
    if json {
        let report = Report {
            resource: &record.resource,
            op_id: &record.op_id,
            invocations: record.invocations,
            outcome: &invocation.outcome,
            model: &invocation.model,
        };
        println!("{}", json_pretty(&report)?);
        return Ok(());
    }
    let status = colorize_status(invocation.outcome.status);
    match (&invocation.outcome.resume_delay_seconds, &invocation.outcome.message) {
        (Some(delay), _) => println!("{}: {status} (resume in {delay}s)", record.resource),
        (None, Some(message)) => println!("{}: {status}: {message}", record.resource),
        (None, None) => println!("{}: {status}", record.resource),
    }
    Ok(())
}

/// Seconds to wait before the next watched invocation. An in-progress outcome
/// without a delay still backs off by the first configured delay.
fn watch_delay(outcome: &InvocationOutcome, config: &HandlerConfig) -> u32 {
    outcome
        .resume_delay_seconds
        .filter(|&d| d > 0)
        .unwrap_or_else(|| config.delay.delay_seconds(1))
}

/// Sleep through a resume delay, returning early on shutdown.
fn wait(resource: &str, seconds: u32) {
    let pb = spinner(&format!("{resource}: waiting {seconds}s before resuming"));
    for _ in 0..seconds {
        if shutdown_requested() {
            break;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    pb.finish_and_clear();
}

pub fn run(state_dir: &Path, options: &ReconcileOptions, json: bool) -> Result<u8, String> {
    let desired = load_manifest(&options.desired)?;
    let previous = options.previous.as_deref().map(load_manifest).transpose()?;
    let resource = desired.1.key();
    let plan = plan(desired, previous, options.rollback)?;

    let config = match &options.config {
        Some(path) => HandlerConfig::load(path)
            .map_err(|e| format!("config error: {}: {e}", path.display()))?,
        None => HandlerConfig::default(),
    };
    let overrides = options
        .error_rules
        .as_deref()
        .map(|path| {
            load_overrides(path).map_err(|e| format!("config error: {}: {e}", path.display()))
        })
        .transpose()?;
    let backend = Backend::from_env(options.endpoint.as_deref())?;
    let store = StateStore::new(state_dir);

    if options.watch {
        install_signal_handler();
    }

    loop {
        let (record, invocation) = {
            let _lock = store.lock().map_err(|e| format!("state lock: {e}"))?;
            let existing = store.load(&resource).map_err(state_err)?;
            let resumed = existing.is_some();
            let mut record = existing.unwrap_or_else(|| OperationRecord::new(&resource));
            let context = resumed.then(|| record.context.clone());
            debug!(%resource, op_id = %record.op_id, resumed, "invoking handler");

            let invocation = backend.with_client(|client| {
                invoke_once(client, &plan, &config, overrides.as_ref(), context)
            })??;

            validate_transition(record.status, invocation.outcome.status).map_err(state_err)?;
            record.invocations += 1;
            record.status = invocation.outcome.status;
            record.context = invocation.context.clone();
            record.last_outcome = Some(invocation.outcome.clone());
            record.updated_at = chrono::Utc::now();

            if record.status == OperationStatus::InProgress {
                store.save(&record).map_err(state_err)?;
            } else {
                store.remove(&resource).map_err(state_err)?;
                info!(
                    %resource,
                    op_id = %record.op_id,
                    status = %record.status,
                    invocations = record.invocations,
                    "operation finished"
                );
            }
            (record, invocation)
        };

        print_report(&record, &invocation, json)?;

        match invocation.outcome.status {
            OperationStatus::Success => return Ok(EXIT_SUCCESS),
            OperationStatus::Failed => {
                let code = invocation
                    .outcome
                    .error_code
                    .map_or_else(|| "unknown".to_owned(), |c| c.to_string());
                let message = invocation.outcome.message.unwrap_or_default();
                return Err(format!("resource operation failed: {code}: {message}"));
            }
            OperationStatus::InProgress => {}
        }
        if !options.watch || shutdown_requested() {
            return Ok(EXIT_SUCCESS);
        }
        wait(&resource, watch_delay(&invocation.outcome, &config));
        if shutdown_requested() {
            return Ok(EXIT_SUCCESS);
        }
    }
}
