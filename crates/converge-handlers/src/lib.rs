//! Database reconcilers built on the converge engine.
//!
//! Each handler is a [`converge_core::Pipeline`] of steps against a
//! [`converge_remote::ControlPlane`]. Mutations are wrapped in exactly-once
//! steps, asynchronous transitions are waited out with probes, and every
//! control-plane error is classified against the tables in [`rules`].

pub mod dbinstance;
pub mod parametergroup;
pub mod rules;

pub use dbinstance::{modify_request, DbInstanceUpdateHandler, UpdateRequest};
pub use parametergroup::{ParameterGroupRequest, ParameterGroupUpdateHandler};

use converge_core::{handle_fault, ErrorRuleSet, EventSink, Fault, ProgressEvent};
use converge_remote::{ControlPlane, RemoteError};
use converge_schema::{ResourceArn, Tag};
use std::collections::BTreeMap;
use tracing::debug;

/// Tags to drop and tags to (re)write to move from one tag set to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagChanges {
    pub remove: Vec<String>,
    pub add: Vec<Tag>,
}

impl TagChanges {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Keys that disappeared are removed; new or changed entries are added.
pub fn tag_changes(previous: &[Tag], desired: &[Tag]) -> TagChanges {
    let before: BTreeMap<&str, &str> = previous
        .iter()
        .map(|t| (t.key.as_str(), t.value.as_str()))
        .collect();
    let after: BTreeMap<&str, &str> = desired
        .iter()
        .map(|t| (t.key.as_str(), t.value.as_str()))
        .collect();

    let remove = before
        .keys()
        .filter(|k| !after.contains_key(*k))
        .map(|k| (*k).to_owned())
        .collect();
    let add = after
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, v)| Tag::new(k, v))
        .collect();
    TagChanges { remove, add }
}

/// Classify a control-plane error against `rules`.
pub(crate) fn remote_fault<M>(
    progress: ProgressEvent<M>,
    err: RemoteError,
    rules: &ErrorRuleSet,
    sink: &dyn EventSink,
) -> ProgressEvent<M> {
    handle_fault(progress, &Fault::from(err), rules, sink)
}

/// Remove stale tag keys, then write new ones. An ignored fault on the removal
/// still lets the additions go out.
pub(crate) fn apply_tag_changes<M>(
    client: &dyn ControlPlane,
    arn: &ResourceArn,
    changes: &TagChanges,
    mut progress: ProgressEvent<M>,
    rules: &ErrorRuleSet,
    sink: &dyn EventSink,
) -> ProgressEvent<M> {
    if !changes.remove.is_empty() {
        debug!(%arn, keys = ?changes.remove, "removing tags");
        if let Err(e) = client.remove_tags(arn, &changes.remove) {
            progress = remote_fault(progress, e, rules, sink);
            if !progress.can_continue() {
                return progress;
            }
        }
    }
    if !changes.add.is_empty() {
        debug!(%arn, count = changes.add.len(), "adding tags");
        if let Err(e) = client.add_tags(arn, &changes.add) {
            return remote_fault(progress, e, rules, sink);
        }
    }
    progress
}
