//! Turn 调度：每个用户 Turn 一个生产者任务
//!
//! spawn_turn 在后台任务中运行主循环，调用方通过 TurnHandle 按序消费流式片段。
//! 丢弃 TurnHandle（或调用 cancel）会取消 CancellationToken，循环在下一个检查点或
//! 正在进行的模型 / 工具调用处中止；结束标记仍会送达。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::AppConfig;
use crate::core::{AgentError, TurnRequest, TurnResult};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::react::{event_bus, ChunkStream, Orchestrator, StreamChunk};

/// 根据配置选择模型后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = cfg
        .llm
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.is_empty());

    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!(model = %cfg.llm.model, "using OpenAI-compatible model");
            Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key)))
        }
        ("openai", None) => {
            tracing::warn!("provider is openai but no API key is set, using mock model");
            Arc::new(MockLlmClient::new())
        }
        _ => {
            tracing::info!("using mock model");
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 运行中 Turn 的句柄：片段流、取消与结果
pub struct TurnHandle {
    stream: ChunkStream,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    join: JoinHandle<Result<TurnResult, AgentError>>,
}

impl TurnHandle {
    /// 下一个片段；结束标记之后返回 None
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.stream.next_chunk().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 收集全部片段（含结束标记）后等待结果
    pub async fn collect(mut self) -> (Vec<StreamChunk>, Result<TurnResult, AgentError>) {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.stream.next_chunk().await {
            chunks.push(chunk);
        }
        let result = self.join_inner().await;
        (chunks, result)
    }

    /// 丢弃剩余片段并等待结果
    pub async fn join(self) -> Result<TurnResult, AgentError> {
        self.collect().await.1
    }

    async fn join_inner(&mut self) -> Result<TurnResult, AgentError> {
        match (&mut self.join).await {
            Ok(result) => result,
            Err(e) => Err(AgentError::FatalInfrastructure(format!("turn task failed: {e}"))),
        }
    }
}

/// 为一个 Turn 启动生产者任务
pub fn spawn_turn(orchestrator: Arc<Orchestrator>, request: TurnRequest) -> TurnHandle {
    let (outbox, stream) = event_bus();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let join = tokio::spawn(async move {
        let panic_outbox = outbox.clone();
        let run = orchestrator.run_turn(request, outbox, task_cancel);
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("turn panicked");
                panic_outbox.finish();
                Err(AgentError::FatalInfrastructure("turn panicked".to_string()))
            }
        }
    });

    TurnHandle {
        stream,
        _cancel_on_drop: cancel.clone().drop_guard(),
        cancel,
        join,
    }
}
