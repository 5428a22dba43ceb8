//! Prompt 构建
//!
//! 每轮把 TurnState 投影为一个 JSON 文档：系统指令（人设、按类别分组的动作目录、输出格式说明）、
//! 工作上下文（记忆块、溢出告警、召回消息、临时文件）、对话历史、本轮状态（Observation、纠错提示、
//! 重复调用警告、heartbeats_used、当前问题）。纠错提示与重复调用警告在渲染后清空。

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::config::{AgentSection, MemorySection};
use crate::core::TurnState;
use crate::memory::{BudgetUsage, Message, TokenEstimator};
use crate::react::ResponseParser;
use crate::tools::{ToolCategory, ToolRegistry, ToolSpec};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are memloop, a helpful assistant with long-term memory. \
Think privately, call one action at a time, and use send_message to answer the user.";

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    parser: ResponseParser,
    catalogue: BTreeMap<ToolCategory, Vec<ToolSpec>>,
    warn_after_epochs: usize,
    context_length: usize,
    chars_per_token: usize,
    overflow_threshold: f64,
}

fn lines(messages: &[&Message]) -> Vec<String> {
    messages.iter().map(|m| m.formatted()).collect()
}

impl PromptBuilder {
    pub fn new(registry: &ToolRegistry, parser: ResponseParser) -> Self {
        let memory = MemorySection::default();
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            parser,
            catalogue: registry.catalogue(),
            warn_after_epochs: AgentSection::default().warn_after_epochs,
            context_length: memory.context_length,
            chars_per_token: memory.average_chars_per_token.max(1),
            overflow_threshold: memory.overflow_threshold,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_agent_config(mut self, agent: &AgentSection) -> Self {
        self.warn_after_epochs = agent.warn_after_epochs;
        self.parser = ResponseParser::new(agent.output_format);
        self
    }

    pub fn with_memory_config(mut self, memory: &MemorySection) -> Self {
        self.context_length = memory.context_length;
        self.chars_per_token = memory.average_chars_per_token.max(1);
        self.overflow_threshold = memory.overflow_threshold;
        self
    }

    pub fn parser(&self) -> &ResponseParser {
        &self.parser
    }

    fn system_instructions(&self) -> Value {
        json!({
            "persona": self.system_prompt,
            "available_actions": self.catalogue,
            "output_format": {
                "format": self.parser.format().name(),
                "instructions": self.parser.format_instructions(),
                "rules": self.parser.format_rules(),
                "examples": self.parser.output_examples(),
            },
        })
    }

    fn working_context(&self, state: &TurnState) -> Value {
        let mut blocks = Vec::new();
        let mut alerts = Vec::new();
        for (ty, pages) in &state.memory_blocks {
            let limit = ty.token_limit(self.context_length);
            let mut used_chars = 0;
            for page in pages {
                blocks.push(page.serialize_for_prompt(limit, self.chars_per_token));
                used_chars += page.content.chars().count();
            }
            let usage = BudgetUsage {
                used_chars,
                capacity_chars: TokenEstimator::new(self.chars_per_token).capacity_chars(limit),
            };
            alerts.extend(usage.alert(ty.as_str(), self.overflow_threshold));
        }
        alerts.extend(state.recall.alert("Recall"));
        alerts.extend(state.conversation.alert());

        let recalled: Vec<&Message> = state.recall.iter().collect();
        json!({
            "memory_blocks": blocks,
            "memory_alerts": alerts,
            "recalled_conversation": lines(&recalled),
            "temporary_files": state.filepaths,
        })
    }

    /// 构建本轮 prompt；会消费纠错提示与重复调用警告
    pub fn build(&self, state: &mut TurnState) -> String {
        let notes = state.working.take_notes();
        let duplicate = state.duplicate_notice.take();

        let mut current = json!({
            "previous_action_results": state.working.to_prompt_section(),
            "system_notes": notes,
            "duplicate_call_warning": duplicate,
            "heartbeats_used": state.epoch_count,
            "current_user_query": state.user_message,
        });
        if state.epoch_count > self.warn_after_epochs {
            current["critical_note"] = json!(format!(
                "CRITICAL: you have used {} heartbeats. Stop calling tools and answer the user now with send_message.",
                state.epoch_count
            ));
        }

        let prompt = json!({
            "system_instructions": self.system_instructions(),
            "working_context": self.working_context(state),
            "conversation_history": lines(&state.conversation.last_page()),
            "current_turn": current,
        });
        serde_json::to_string_pretty(&prompt).unwrap_or_else(|_| prompt.to_string())
    }

    /// Error 路径：只带最近的几条消息与当前问题，要求直接回答
    pub fn build_direct_answer(&self, state: &TurnState, history: usize) -> String {
        let prompt = json!({
            "system_instructions": {
                "persona": self.system_prompt,
                "task": "Answer the user's query directly in markdown. Do not use tags or actions.",
            },
            "conversation_history": lines(&state.conversation.recent(history)),
            "current_user_query": state.user_message,
        });
        serde_json::to_string_pretty(&prompt).unwrap_or_else(|_| prompt.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActionResult, TurnRequest, User};
    use crate::memory::{ConversationMemory, MemoryBlock, MemoryType, RecallWindow, WorkingMemory};
    use crate::react::{event_bus, OutputFormat};
    use crate::tools::{SendMessageTool, ToolCategory};
    use uuid::Uuid;

    fn builder() -> PromptBuilder {
        let mut reg = ToolRegistry::new();
        reg.register(ToolCategory::Core, SendMessageTool);
        PromptBuilder::new(&reg, ResponseParser::new(OutputFormat::Json))
    }

    fn state() -> TurnState {
        let (outbox, _stream) = event_bus();
        let mut s = TurnState::new(
            TurnRequest::new(Uuid::new_v4(), User::new("u"), "What's 2+2?"),
            outbox,
            WorkingMemory::new(10),
            RecallWindow::new(1000, 0.8),
            ConversationMemory::new(20, 4000),
        );
        s.push_message(Message::user("What's 2+2?"));
        s
    }

    fn parse(prompt: &str) -> Value {
        serde_json::from_str(prompt).unwrap()
    }

    #[test]
    fn test_prompt_sections() {
        let b = builder();
        let mut s = state();
        s.working.push_observation(ActionResult::success("t", "python_code_runner", "4"));
        let v = parse(&b.build(&mut s));
        assert_eq!(v["current_turn"]["current_user_query"], "What's 2+2?");
        assert_eq!(v["current_turn"]["heartbeats_used"], 0);
        assert_eq!(v["current_turn"]["previous_action_results"][0]["result"], "4");
        assert!(v["system_instructions"]["available_actions"]["core"][0]["name"] == "send_message");
        assert_eq!(v["system_instructions"]["output_format"]["format"], "json");
        assert!(v["conversation_history"][0].as_str().unwrap().contains("What's 2+2?"));
        assert!(v["current_turn"].get("critical_note").is_none());
    }

    #[test]
    fn test_notes_and_duplicate_warning_are_consumed() {
        let b = builder();
        let mut s = state();
        s.working.add_note("Your last response could not be parsed");
        s.duplicate_notice = Some("repeated call".into());
        let first = parse(&b.build(&mut s));
        assert_eq!(first["current_turn"]["system_notes"][0], "Your last response could not be parsed");
        assert_eq!(first["current_turn"]["duplicate_call_warning"], "repeated call");

        let second = parse(&b.build(&mut s));
        assert!(second["current_turn"]["system_notes"].as_array().unwrap().is_empty());
        assert!(second["current_turn"]["duplicate_call_warning"].is_null());
    }

    #[test]
    fn test_critical_note_after_warn_threshold() {
        let b = builder().with_agent_config(&AgentSection {
            warn_after_epochs: 2,
            ..AgentSection::default()
        });
        let mut s = state();
        s.epoch_count = 3;
        let v = parse(&b.build(&mut s));
        assert!(v["current_turn"]["critical_note"].as_str().unwrap().starts_with("CRITICAL"));
    }

    #[test]
    fn test_memory_blocks_and_overflow_alert() {
        let b = builder().with_memory_config(&MemorySection {
            context_length: 1000,
            ..MemorySection::default()
        });
        let mut s = state();
        // archival: 1% of 1000 = 10 tokens = 40 chars
        s.load_memory_block(MemoryBlock::new(s.user.id, MemoryType::Archival, "x".repeat(36)));
        let v = parse(&b.build(&mut s));
        assert!(v["working_context"]["memory_blocks"][0]
            .as_str()
            .unwrap()
            .starts_with("[Memory Block: archival"));
        assert_eq!(v["working_context"]["memory_alerts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_direct_answer_prompt_keeps_recent_history() {
        let b = builder();
        let mut s = state();
        for i in 0..8 {
            s.push_message(Message::assistant(format!("msg {i}")));
        }
        let v = parse(&b.build_direct_answer(&s, 5));
        assert_eq!(v["conversation_history"].as_array().unwrap().len(), 5);
        assert_eq!(v["current_user_query"], "What's 2+2?");
    }
}
