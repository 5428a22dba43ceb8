//! 短期记忆：对话历史
//!
//! 按字符预算保留最近的消息（超出时 FIFO 淘汰），渲染到 prompt 时只取最近一页。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::token_budget::{truncate_text, BoundedWindow, Measured};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
            Role::Tool => "Tool",
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// prompt 中的一行：`[User - (2025-01-01 10:00:00 UTC)] 内容`
    pub fn formatted(&self) -> String {
        format!(
            "[{} - ({})] {}",
            self.role.label(),
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.content
        )
    }
}

impl Measured for Message {
    fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    fn truncate_chars(&mut self, max_chars: usize) {
        self.content = truncate_text(&self.content, max_chars);
    }
}

/// 会话检索召回的消息（同样受预算约束）
pub type RecallWindow = BoundedWindow<Message>;

/// 短期记忆：字符预算内的对话历史
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    window: BoundedWindow<Message>,
    page_size: usize,
}

impl ConversationMemory {
    pub fn new(page_size: usize, capacity_chars: usize) -> Self {
        Self {
            window: BoundedWindow::new(capacity_chars, 0.8),
            page_size,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.window.push(msg);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        for m in messages {
            self.push(m);
        }
    }

    /// 最近一页（时间顺序）
    pub fn last_page(&self) -> Vec<&Message> {
        self.window.recent(self.page_size).collect()
    }

    /// 最近 n 条（时间顺序）
    pub fn recent(&self, n: usize) -> Vec<&Message> {
        self.window.recent(n).collect()
    }

    pub fn messages(&self) -> Vec<&Message> {
        self.window.iter().collect()
    }

    pub fn alert(&self) -> Option<String> {
        self.window.alert("Conversation")
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
