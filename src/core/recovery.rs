//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供主循环决定是重试、记为 Observation、强制收尾还是终止。

use crate::core::{AgentError, RecoveryAction};
use crate::react::OutputFormat;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    format: OutputFormat,
}

impl RecoveryEngine {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::ParseFailure(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Validation failed while parsing your {fmt} response: {raw}. \
                 Respond with at most one <inner_monologue> block and EXACTLY ONE <action> block \
                 whose body is valid {fmt} with a non-empty `name` field.",
                fmt = self.format.name()
            )),
            AgentError::UnknownTool { .. }
            | AgentError::InvalidParameters { .. }
            | AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_)
            | AgentError::NotFound(_) => {
                RecoveryAction::Observe(format!("Error executing action: {err}"))
            }
            AgentError::RunawayLoop(epochs) => RecoveryAction::ForceFinal(format!(
                "Stopped after {epochs} model invocations without a final answer"
            )),
            AgentError::TransientProvider(_)
            | AgentError::Llm(_)
            | AgentError::FatalInfrastructure(_)
            | AgentError::Cancelled
            | AgentError::Config(_) => RecoveryAction::Abort,
        }
    }
}
