//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / Observe / ForceFinal / Abort。
//! 除基础设施故障与取消外，其余错误都在循环内部被吸收（纠错提示、Observation 或强制收尾）。

use thiserror::Error;

use crate::llm::LlmError;

/// 一次 Turn 中可能出现的错误（解析、工具、死循环、模型限流、基础设施等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型输出缺少 / 多出 action 块，或结构化内容无法反序列化
    #[error("Parse failure: {0}")]
    ParseFailure(String),

    #[error("Unknown tool: {name}. Available tools: {available}")]
    UnknownTool { name: String, available: String },

    #[error("Invalid parameters for {tool}: {reason}")]
    InvalidParameters { tool: String, reason: String },

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 模型调用次数超过硬上限
    #[error("Runaway loop: {0} model invocations without a final answer")]
    RunawayLoop(usize),

    /// 限流等瞬时错误，单次退避重试后仍失败
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Memory Store / 持久化不可用，Turn 无法继续
    #[error("Fatal infrastructure error: {0}")]
    FatalInfrastructure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 是否必须终止当前 Turn（调用方会看到一个 error chunk）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::FatalInfrastructure(_)
                | AgentError::TransientProvider(_)
                | AgentError::Llm(_)
                | AgentError::Cancelled
                | AgentError::Config(_)
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将纠错提示注入下一轮 prompt，让模型重新输出
    RetryWithPrompt(String),
    /// 作为 Observation 写回上下文，循环继续
    Observe(String),
    /// 停止循环，用已有内容强制给出最终回复
    ForceFinal(String),
    /// 终止当前 Turn
    Abort,
}
