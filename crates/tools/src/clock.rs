//! Read-only clock tool.

use async_trait::async_trait;
use chrono::{Local, Utc};
use proto::{ParameterProperty, ToolParameters, ToolResult};

use crate::Tool;

/// Reports the device's current date and time.
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "system.time"
    }

    fn description(&self) -> &str {
        "Get the current date and time on the device."
    }

    fn requires_approval(&self) -> bool {
        false
    }

    fn parameters(&self) -> ToolParameters {
        ToolParameters::new().optional(
            "zone",
            ParameterProperty::string("Which clock to read").with_enum(["local", "utc"]),
        )
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        match input["zone"].as_str().unwrap_or("local") {
            "local" => ToolResult::success(serde_json::json!({
                "zone": "local",
                "now": Local::now().to_rfc3339(),
            })),
            "utc" => ToolResult::success(serde_json::json!({
                "zone": "utc",
                "now": Utc::now().to_rfc3339(),
            })),
            other => ToolResult::error(format!("Unknown zone '{other}', expected local or utc")),
        }
    }
}
