//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：generate（非流式）、stream（流式片段）。
//! 错误区分限流（可退避重试一次）与其他 API / 网络错误。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("rate limited by provider (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },
    #[error("API error: {0}")]
    Api(String),
    #[error("network error: {0}")]
    Network(String),
}

impl LlmError {
    pub fn is_throttling(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

/// 模型输出片段流
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// 流式完成；打开流与读取过程中都可能返回错误
    async fn stream(&self, prompt: &str) -> Result<TokenStream, LlmError>;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 限流重试策略：最多重试 max_retries 次，每次等待 delay
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryConfig {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay: Duration::from_millis(10_000),
        }
    }
}

/// 将 provider 错误文本归类（429 / rate limit 视为限流）
pub fn classify_provider_error(message: impl Into<String>) -> LlmError {
    let message = message.into();
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        LlmError::RateLimited { retry_after_ms: 0 }
    } else if lower.contains("connect") || lower.contains("timed out") || lower.contains("dns") {
        LlmError::Network(message)
    } else {
        LlmError::Api(message)
    }
}
