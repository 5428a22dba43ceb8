//! send_message：向用户发送最终回复（终止动作）
//!
//! 支持直接给出 message，或给出 filepath 将文件内容作为回复；二者都缺失时返回错误结果。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ActionResult, TurnState};
use crate::tools::schema::params_schema;
use crate::tools::{parse_args, Tool, ToolError};

pub const SEND_MESSAGE: &str = "send_message";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SendMessageParams {
    /// Markdown message shown to the user
    #[serde(default)]
    pub message: Option<String>,
    /// Path of a file whose content is sent as the message
    #[serde(default)]
    pub filepath: Option<String>,
}

#[derive(Debug, Default)]
pub struct SendMessageTool;

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        SEND_MESSAGE
    }

    fn description(&self) -> &str {
        "Send the final answer to the user and end your turn. Provide `message` (markdown) or `filepath` to send a file's content."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<SendMessageParams>()
    }

    async fn execute(&self, _state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: SendMessageParams = parse_args(args)?;

        if let Some(message) = params.message.filter(|m| !m.trim().is_empty()) {
            return Ok(ActionResult::success(thought, SEND_MESSAGE, message));
        }

        if let Some(path) = params.filepath.filter(|p| !p.trim().is_empty()) {
            let content = tokio::fs::read_to_string(path.trim())
                .await
                .map_err(|e| ToolError::Failed(format!("could not read {path}: {e}")))?;
            return Ok(ActionResult::success(thought, SEND_MESSAGE, content));
        }

        Ok(ActionResult::failure(
            thought,
            SEND_MESSAGE,
            "Either `message` or `filepath` must be provided.",
        ))
    }
}
