use super::{colorize_status, json_pretty, state_err, EXIT_SUCCESS};
use crate::state::StateStore;

pub fn run(store: &StateStore, json: bool) -> Result<u8, String> {
    let records = store.list().map_err(state_err)?;
    if json {
        println!("{}", json_pretty(&records)?);
    } else if records.is_empty() {
        println!("no operations in flight");
    } else {
        println!(
            "{:<36} {:<28} {:<12} {:<12} {:<8} UPDATED",
            "RESOURCE", "OP_ID", "INVOCATIONS", "STATUS", "RESUME"
        );
        for record in &records {
            let resume = record
                .resume_delay()
                .map_or_else(|| "-".to_owned(), |d| format!("{d}s"));
            println!(
                "{:<36} {:<28} {:<12} {:<12} {:<8} {}",
                record.resource,
                record.op_id,
                record.invocations,
                colorize_status(record.status),
                resume,
                record.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
