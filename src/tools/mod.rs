//! 工具箱：注册表、分发器与内置工具（消息、会话检索、记忆、代码、网页、任务清单）

pub mod code_runner;
pub mod conversation_search;
pub mod dispatcher;
pub mod memory_blocks;
pub mod memory_pages;
pub mod registry;
pub mod schema;
pub mod send_message;
pub mod tasks;
pub mod web;

pub use code_runner::CodeRunnerTool;
pub use conversation_search::ConversationSearchTool;
pub use dispatcher::ToolDispatcher;
pub use memory_blocks::{BlockAppendTool, BlockDeleteTool, BlockReadTool, BlockReplaceTool, BlockUpsertTool};
pub use memory_pages::{MemoryAppendTool, MemoryEvictTool, MemoryReadTool, MemoryReplaceTool};
pub use registry::{parse_args, Tool, ToolCategory, ToolError, ToolRegistry, ToolSpec};
pub use schema::params_schema;
pub use send_message::{SendMessageTool, SEND_MESSAGE};
pub use tasks::{CompleteTaskTool, CreateTaskTool, ListTasksTool, TaskBoard, TaskItem, TaskStatus};
pub use web::DownloadWebpageTool;
