//! python_code_runner：在子进程中运行一段 Python 代码
//!
//! 直接 exec 解释器（`python3 -c <code>`），不经过 shell；自带超时，超时后子进程被 kill。
//! 返回 stdout，非零退出时附带退出码与 stderr。

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::core::{ActionResult, TurnState};
use crate::tools::schema::params_schema;
use crate::tools::{parse_args, Tool, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CodeRunnerParams {
    /// Python source; print() whatever you need to see
    pub code: String,
}

pub struct CodeRunnerTool {
    interpreter: String,
    timeout: Duration,
}

impl CodeRunnerTool {
    pub fn new(interpreter: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl Tool for CodeRunnerTool {
    fn name(&self) -> &str {
        "python_code_runner"
    }

    fn description(&self) -> &str {
        "Run Python code in a subprocess and return its stdout. Use for arithmetic, data processing and quick checks."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<CodeRunnerParams>()
    }

    async fn execute(&self, _state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: CodeRunnerParams = parse_args(args)?;
        if params.code.trim().is_empty() {
            return Err(ToolError::InvalidParameters("code must not be empty".to_string()));
        }

        tracing::info!(interpreter = %self.interpreter, bytes = params.code.len(), "python_code_runner execute");

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-c").arg(&params.code).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ToolError::Failed(format!("Code timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| ToolError::Failed(format!("Failed to start {}: {e}", self.interpreter)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if output.status.success() {
            let text = if stdout.is_empty() && !stderr.is_empty() {
                stderr
            } else {
                stdout
            };
            return Ok(ActionResult::success(thought, self.name(), text));
        }

        let code = output.status.code().map_or_else(|| "signal".to_string(), |c| c.to_string());
        let mut text = format!("exit code {code}");
        if !stdout.is_empty() {
            text.push_str(&format!("\nstdout:\n{stdout}"));
        }
        if !stderr.is_empty() {
            text.push_str(&format!("\nstderr:\n{stderr}"));
        }
        Ok(ActionResult::failure(thought, self.name(), text))
    }
}
