//! 状态定义：TurnState 与 Turn 的输入 / 输出
//!
//! 每个用户请求对应一个 TurnState，由 Orchestrator 独占持有并在循环中原地修改；
//! 工具执行时通过 `&mut TurnState` 写入 Observation、召回结果与临时文件。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::{ConversationMemory, MemoryBlock, MemoryType, Message, RecallWindow, WorkingMemory};
use crate::react::{AgentThought, Outbox, ToolCallFingerprint};

/// 当前阶段：需要工具 / 需要最终回复 / 错误收尾
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NeedTool,
    NeedFinal,
    Error,
}

/// 发起请求的用户
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// 一次 Turn 的输入
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRequest {
    pub conversation_id: Uuid,
    pub user: User,
    pub message: String,
}

impl TurnRequest {
    pub fn new(conversation_id: Uuid, user: User, message: impl Into<String>) -> Self {
        Self {
            conversation_id,
            user,
            message: message.into(),
        }
    }
}

/// 一次 Turn 的结果（持久化与返回给调用方）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnResult {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub user_message: String,
    pub answer: String,
    pub phase: Phase,
    pub epochs: usize,
    /// 是否为兜底回复（重试上限 / 轮次上限）
    pub fallback: bool,
    pub finished_at: DateTime<Utc>,
}

/// 一次动作执行的结果，作为 Observation 回填到下一轮 prompt
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub thought: String,
    pub action: String,
    pub result: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_error: bool,
}

impl ActionResult {
    pub fn success(thought: impl Into<String>, action: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            thought: thought.into(),
            action: action.into(),
            result: result.into(),
            timestamp: Utc::now(),
            is_error: false,
        }
    }

    pub fn failure(thought: impl Into<String>, action: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::success(thought, action, result)
        }
    }
}

/// 单个 Turn 的完整内部状态
#[derive(Debug)]
pub struct TurnState {
    pub conversation_id: Uuid,
    pub user: User,
    pub user_message: String,
    pub phase: Phase,
    pub prompt: String,
    pub last_model_output: String,
    pub pending_thought: Option<AgentThought>,
    /// Observation 与纠错提示
    pub working: WorkingMemory,
    /// 每类记忆在工作上下文中的页（按载入顺序）
    pub memory_blocks: BTreeMap<MemoryType, Vec<MemoryBlock>>,
    pub recall: RecallWindow,
    pub conversation: ConversationMemory,
    pub epoch_count: usize,
    pub retry_count: usize,
    pub last_tool_call: Option<ToolCallFingerprint>,
    pub duplicate_notice: Option<String>,
    pub filepaths: Vec<String>,
    pub outbox: Outbox,
}

impl TurnState {
    pub fn new(
        request: TurnRequest,
        outbox: Outbox,
        working: WorkingMemory,
        recall: RecallWindow,
        conversation: ConversationMemory,
    ) -> Self {
        Self {
            conversation_id: request.conversation_id,
            user: request.user,
            user_message: request.message,
            phase: Phase::NeedTool,
            prompt: String::new(),
            last_model_output: String::new(),
            pending_thought: None,
            working,
            memory_blocks: BTreeMap::new(),
            recall,
            conversation,
            epoch_count: 0,
            retry_count: 0,
            last_tool_call: None,
            duplicate_notice: None,
            filepaths: Vec::new(),
            outbox,
        }
    }

    /// 将读取或写入的页放入工作上下文；同 id 的页原地替换，新页追加在后
    pub fn load_memory_block(&mut self, block: MemoryBlock) {
        let pages = self.memory_blocks.entry(block.memory_type).or_default();
        match pages.iter_mut().find(|p| p.id == block.id) {
            Some(existing) => *existing = block,
            None => pages.push(block),
        }
    }

    /// 唯一块模型：该类只保留这一个块
    pub fn set_memory_block(&mut self, block: MemoryBlock) {
        self.memory_blocks.insert(block.memory_type, vec![block]);
    }

    /// 从工作上下文移除一页；该类没有剩余页时整类移除
    pub fn unload_memory_block(&mut self, memory_type: MemoryType, id: Uuid) {
        if let Some(pages) = self.memory_blocks.get_mut(&memory_type) {
            pages.retain(|p| p.id != id);
            if pages.is_empty() {
                self.memory_blocks.remove(&memory_type);
            }
        }
    }

    /// 工作上下文中某类记忆的全部文本（各页以换行拼接）
    pub fn memory_text(&self, memory_type: MemoryType) -> Option<String> {
        self.memory_blocks.get(&memory_type).map(|pages| {
            pages
                .iter()
                .map(|p| p.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    pub fn push_message(&mut self, message: Message) {
        self.conversation.push(message);
    }

    pub fn to_result(&self, answer: impl Into<String>, fallback: bool) -> TurnResult {
        TurnResult {
            conversation_id: self.conversation_id,
            user_id: self.user.id,
            user_message: self.user_message.clone(),
            answer: answer.into(),
            phase: self.phase,
            epochs: self.epoch_count,
            fallback,
            finished_at: Utc::now(),
        }
    }
}
