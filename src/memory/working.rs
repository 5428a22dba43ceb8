//! 工作记忆：本轮的 Observation 与纠错提示
//!
//! 仅在单个 Turn 内有效。Observation 按页大小保留最近的若干条（最旧的先丢弃），
//! 纠错提示（解析失败、工具错误）只注入下一轮 prompt。

use std::collections::VecDeque;

use crate::core::ActionResult;

#[derive(Clone, Debug)]
pub struct WorkingMemory {
    observations: VecDeque<ActionResult>,
    notes: Vec<String>,
    page_size: usize,
}

impl WorkingMemory {
    pub fn new(page_size: usize) -> Self {
        Self {
            observations: VecDeque::new(),
            notes: Vec::new(),
            page_size: page_size.max(1),
        }
    }

    pub fn push_observation(&mut self, result: ActionResult) {
        self.observations.push_back(result);
        while self.observations.len() > self.page_size {
            self.observations.pop_front();
        }
    }

    pub fn observations(&self) -> impl Iterator<Item = &ActionResult> {
        self.observations.iter()
    }

    /// 最近一次成功的 Observation（用于强制收尾）
    pub fn last_success(&self) -> Option<&ActionResult> {
        self.observations.iter().rev().find(|o| !o.is_error)
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// 取出并清空纠错提示（渲染进 prompt 后调用）
    pub fn take_notes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.notes.clear();
    }

    /// 构建 prompt 中的 previous_action_results 片段
    pub fn to_prompt_section(&self) -> Vec<serde_json::Value> {
        self.observations
            .iter()
            .map(|o| {
                serde_json::json!({
                    "thought": o.thought,
                    "action": o.action,
                    "result": o.result,
                    "is_error": o.is_error,
                    "timestamp": o.timestamp.to_rfc3339(),
                })
            })
            .collect()
    }
}
