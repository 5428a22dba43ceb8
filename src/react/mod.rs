//! 认知层：响应解析、prompt 构建、流式事件与单个 Turn 的主循环

pub mod events;
pub mod loop_;
pub mod parser;
pub mod prompt;

pub use events::{event_bus, ChunkStream, FinishGuard, Outbox, Stage, StreamChunk};
pub use loop_::{Orchestrator, EPOCH_FALLBACK, PARSE_FALLBACK};
pub use parser::{Action, AgentThought, OutputFormat, ResponseParser, ToolCallFingerprint};
pub use prompt::{PromptBuilder, DEFAULT_SYSTEM_PROMPT};
