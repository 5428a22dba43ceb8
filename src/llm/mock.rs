//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 按脚本依次返回预设回复（可模拟限流、流中断）；脚本耗尽后回显 prompt 中的
//! `current_user_query`，包装为 send_message 动作，便于本地跑通整个循环。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError, TokenStream};

/// 一次调用的脚本化结果
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    /// 打开流（或 generate）时即失败
    Error(LlmError),
    /// 先输出部分文本，再在流中途失败
    FailMidStream(String, LlmError),
}

impl From<&str> for MockReply {
    fn from(text: &str) -> Self {
        MockReply::Text(text.to_string())
    }
}

impl From<String> for MockReply {
    fn from(text: String) -> Self {
        MockReply::Text(text)
    }
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<MockReply>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<I, R>(replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<MockReply>,
    {
        Self {
            script: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: impl Into<MockReply>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply.into());
    }

    /// 已收到的全部 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_reply(&self, prompt: &str) -> MockReply {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| MockReply::Text(echo_reply(prompt)))
    }
}

/// 从 JSON prompt 中找出当前用户问题并回显为 send_message
fn echo_reply(prompt: &str) -> String {
    let query = serde_json::from_str::<serde_json::Value>(prompt)
        .ok()
        .and_then(|v| find_field(&v, "current_user_query"))
        .unwrap_or_else(|| "(no input)".to_string());
    let action = serde_json::json!({
        "name": "send_message",
        "description": "Echo the user's message",
        "params": { "message": format!("Echo from Mock: {}", query) },
        "request_heartbeat": false,
    });
    format!(
        "<inner_monologue>\nEchoing the user.\n</inner_monologue>\n<action>\n{}\n</action>",
        action
    )
}

fn find_field(value: &serde_json::Value, key: &str) -> Option<String> {
    match value {
        serde_json::Value::Object(map) => map
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .or_else(|| map.values().find_map(|v| find_field(v, key))),
        serde_json::Value::Array(items) => items.iter().find_map(|v| find_field(v, key)),
        _ => None,
    }
}

/// 按空白切分为片段，拼接后与原文一致
fn fragments(text: &str) -> Vec<Result<String, LlmError>> {
    text.split_inclusive(char::is_whitespace)
        .map(|s| Ok(s.to_string()))
        .collect()
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        match self.next_reply(prompt) {
            MockReply::Text(text) => Ok(text),
            MockReply::Error(e) | MockReply::FailMidStream(_, e) => Err(e),
        }
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream, LlmError> {
        match self.next_reply(prompt) {
            MockReply::Text(text) => Ok(Box::pin(stream::iter(fragments(&text)))),
            MockReply::Error(e) => Err(e),
            MockReply::FailMidStream(partial, e) => {
                let mut items = fragments(&partial);
                items.push(Err(e));
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}
