//! memloop - Rust 智能体编排引擎
//!
//! 模块划分：
//! - **agent**: 无头运行时（从配置构建全部组件，流式或阻塞地处理一条用户消息）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、Turn 状态、构建器、Turn 调度（生产者任务 + 取消）
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Mock）以及嵌入
//! - **memory**: 记忆块（唯一 / 分页）、预算与溢出控制、对话历史、持久化
//! - **react**: 响应解析、prompt 构建、流式事件、主循环
//! - **tools**: 工具注册表、分发器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::AgentRuntime;
pub use core::{spawn_turn, AgentError, TurnHandle, TurnRequest, TurnResult, User};
pub use react::{Orchestrator, Stage, StreamChunk};
