pub mod abandon;
pub mod completions;
pub mod man_pages;
pub mod reconcile;
pub mod status;

use converge_core::OperationStatus;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STATE_ERROR: u8 = 3;
pub const EXIT_RESOURCE_FAILED: u8 = 4;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn colorize_status(status: OperationStatus) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        OperationStatus::Success => Style::new().green().apply_to(text).to_string(),
        OperationStatus::InProgress => Style::new().cyan().apply_to(text).to_string(),
        OperationStatus::Failed => Style::new().red().bold().apply_to(text).to_string(),
    }
}

pub fn state_err(e: impl std::fmt::Display) -> String {
    format!("state error: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_objects() {
        let val = serde_json::json!({"resource": "db-instance/orders-db"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"resource\""));
    }

    #[test]
    fn colorized_status_keeps_the_text() {
        for status in [
            OperationStatus::InProgress,
            OperationStatus::Success,
            OperationStatus::Failed,
        ] {
            assert!(colorize_status(status).contains(&status.to_string()));
        }
    }

    #[test]
    fn state_errors_carry_their_prefix() {
        assert!(state_err("disk full").starts_with("state error:"));
    }
}
