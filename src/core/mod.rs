//! 核心编排层：错误与恢复、Turn 状态、构建器、Turn 调度

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod state;

pub use builder::AgentBuilder;
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{create_llm_from_config, spawn_turn, TurnHandle};
pub use recovery::RecoveryEngine;
pub use state::{ActionResult, Phase, TurnRequest, TurnResult, TurnState, User};
