//! 记忆层：记忆块存储与管理（唯一块 / 分页块）、预算与溢出控制、对话历史、工作记忆、持久化

pub mod conversation;
pub mod manager;
pub mod persistence;
pub mod store;
pub mod token_budget;
pub mod types;
pub mod working;

pub use conversation::{ConversationMemory, Message, RecallWindow, Role};
pub use manager::{MemoryManager, PageEviction};
pub use persistence::{InMemoryPersistence, JsonFilePersistence, TurnPersistence};
pub use store::{cosine_similarity, ArchivedMessage, InMemoryStore, MemoryError, MemoryStore};
pub use token_budget::{BoundedWindow, BudgetUsage, Measured, TokenEstimator};
pub use types::{total_pages, MemoryBlock, MemoryType, PaginatedResult};
pub use working::WorkingMemory;
