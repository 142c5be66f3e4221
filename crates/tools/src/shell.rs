//! Shell command tool.

use async_trait::async_trait;
use proto::{ParameterProperty, ToolError, ToolParameters, ToolResult};
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::Tool;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_OUTPUT_CHARS: usize = 10_000;

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    working_dir: Option<String>,
}

/// Tool that runs a command through `sh -c`
pub struct ShellTool {
    default_timeout: Duration,
}

impl ShellTool {
    /// Creates a shell tool with the default timeout.
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Creates a shell tool with a custom default timeout in seconds.
    pub fn with_timeout(secs: u64) -> Self {
        Self {
            default_timeout: Duration::from_secs(secs),
        }
    }

    async fn run(&self, args: ShellArgs) -> Result<serde_json::Value, ToolError> {
        let timeout_duration = args
            .timeout_secs
            .map(|s| Duration::from_secs(s.min(MAX_TIMEOUT_SECS)))
            .unwrap_or(self.default_timeout);

        debug!("Executing shell command: {}", args.command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&args.command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(dir) = &args.working_dir {
            cmd.current_dir(dir);
        }

        let output = match timeout(timeout_duration, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    "Shell command timed out after {}s: {}",
                    timeout_duration.as_secs(),
                    args.command
                );
                return Err(ToolError::Timeout(timeout_duration.as_secs()));
            }
        };

        // Non-zero exit is reported as data, not as a failure; the model decides.
        Ok(serde_json::json!({
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": truncate_str(&String::from_utf8_lossy(&output.stdout), MAX_OUTPUT_CHARS / 2),
            "stderr": truncate_str(&String::from_utf8_lossy(&output.stderr), MAX_OUTPUT_CHARS / 2),
        }))
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell.run"
    }

    fn description(&self) -> &str {
        "Run a shell command on the device and return stdout, stderr, and exit code. \
         Output is limited to 10,000 characters. Timeout is 30 seconds by default."
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn parameters(&self) -> ToolParameters {
        ToolParameters::new()
            .required(
                "command",
                ParameterProperty::string("The shell command to execute"),
            )
            .optional(
                "timeout_secs",
                ParameterProperty::new("integer", "Timeout in seconds (default: 30, max: 300)"),
            )
            .optional(
                "working_dir",
                ParameterProperty::string("Working directory for the command"),
            )
    }

    fn describe_call(&self, input: &serde_json::Value) -> String {
        match input["command"].as_str() {
            Some(command) => format!("Run shell command: {command}"),
            None => "Run a shell command".to_string(),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let args: ShellArgs = match serde_json::from_value(input) {
            Ok(a) => a,
            Err(e) => return ToolError::InvalidArgs(e.to_string()).into(),
        };
        match self.run(args).await {
            Ok(payload) => ToolResult::success(payload),
            Err(e) => e.into(),
        }
    }
}

/// Truncates UTF-8 text to `max_chars` code points and appends a suffix when truncated.
fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}\n[... output truncated at {max_chars} chars]")
    }
}
