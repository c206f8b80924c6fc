use super::{json_pretty, state_err, EXIT_SUCCESS};
use crate::state::StateStore;
use tracing::warn;

/// Drop the in-flight record so the next reconcile starts a new operation.
/// Nothing is undone on the control plane.
pub fn run(store: &StateStore, resource: &str, json: bool) -> Result<u8, String> {
    let _lock = store.lock().map_err(|e| format!("state lock: {e}"))?;
    let Some(record) = store.load(resource).map_err(state_err)? else {
        return Err(format!("no operation in flight for '{resource}'"));
    };
    store.remove(resource).map_err(state_err)?;
    warn!(
        resource,
        op_id = %record.op_id,
        invocations = record.invocations,
        "abandoned in-flight operation"
    );
    if json {
        let payload = serde_json::json!({
            "resource": resource,
            "op_id": record.op_id,
            "invocations": record.invocations,
            "abandoned": true,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("abandoned {} ({})", resource, record.op_id);
    }
    Ok(EXIT_SUCCESS)
}
