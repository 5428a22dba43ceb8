//! 主循环：单个用户 Turn 的有限状态机
//!
//! 构建 prompt -> 调用模型（流式）-> 解析 -> 重复调用检测 -> 分发工具 -> 记录 Observation -> 路由：
//! - send_message：NeedFinal，按行流式输出最终回复、持久化、结束
//! - request_heartbeat：NeedTool，继续下一轮
//! - 其他：Error，只带最近几条消息再调用一次模型直接作答
//!
//! 解析失败按 retry_ceiling 重试，达到上限后以兜底 send_message 收尾；轮数达到 max_epochs 时强制收尾。
//! 只有基础设施错误、模型错误与取消会异常终止，此时发送一个 error 片段；结束标记总会发送。

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentSection, MemorySection};
use crate::core::{
    ActionResult, AgentError, Phase, RecoveryAction, RecoveryEngine, TurnRequest, TurnResult, TurnState,
};
use crate::llm::{LlmClient, LlmError, RetryConfig};
use crate::memory::{
    ConversationMemory, MemoryManager, MemoryType, Message, RecallWindow, TokenEstimator, TurnPersistence,
    WorkingMemory,
};
use crate::react::{Action, AgentThought, Outbox, PromptBuilder, ResponseParser, Stage};
use crate::tools::{ToolDispatcher, SEND_MESSAGE};

/// 解析连续失败达到上限时的兜底回复
pub const PARSE_FALLBACK: &str =
    "I'm sorry, I had trouble putting together a proper response. Could you rephrase your question?";
/// 达到轮次上限且没有任何成功结果时的兜底回复
pub const EPOCH_FALLBACK: &str =
    "I'm sorry, I could not finish working on your request. Please try again with a more specific question.";

pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<ToolDispatcher>,
    memory: Arc<MemoryManager>,
    persistence: Arc<dyn TurnPersistence>,
    prompts: PromptBuilder,
    recovery: RecoveryEngine,
    agent: AgentSection,
    throttle: RetryConfig,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<ToolDispatcher>,
        memory: Arc<MemoryManager>,
        persistence: Arc<dyn TurnPersistence>,
    ) -> Self {
        let prompts = PromptBuilder::new(dispatcher.registry(), ResponseParser::default())
            .with_memory_config(memory.settings());
        Self {
            llm,
            dispatcher,
            memory,
            persistence,
            prompts,
            recovery: RecoveryEngine::default(),
            agent: AgentSection::default(),
            throttle: RetryConfig::default(),
        }
    }

    pub fn with_agent_config(mut self, agent: &AgentSection) -> Self {
        self.prompts = self.prompts.with_agent_config(agent);
        self.recovery = RecoveryEngine::new(agent.output_format);
        self.agent = agent.clone();
        self
    }

    pub fn with_memory_config(mut self, memory: &MemorySection) -> Self {
        self.prompts = self.prompts.with_memory_config(memory);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompts = self.prompts.with_system_prompt(prompt);
        self
    }

    pub fn with_throttle_retry(mut self, throttle: RetryConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// 执行一个 Turn。无论成功、失败还是 panic，outbox 都会收到结束标记
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        outbox: Outbox,
        cancel: CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        let _finish = outbox.finish_guard();
        let result = self.drive(request, outbox.clone(), &cancel).await;
        match &result {
            Ok(r) => {
                let (_, _, total_tokens) = self.llm.token_usage();
                tracing::info!(
                    epochs = r.epochs,
                    phase = ?r.phase,
                    fallback = r.fallback,
                    total_tokens,
                    "turn finished"
                );
            }
            Err(AgentError::Cancelled) => tracing::info!("turn cancelled"),
            Err(e) => {
                tracing::error!(error = %e, "turn aborted");
                outbox.stage(Stage::Error, e.to_string());
            }
        }
        result
    }

    fn new_state(&self, request: TurnRequest, outbox: Outbox) -> TurnState {
        let settings = self.memory.settings();
        let estimator = TokenEstimator::new(settings.average_chars_per_token);
        TurnState::new(
            request,
            outbox,
            WorkingMemory::new(self.agent.observations_page_size),
            RecallWindow::new(
                self.memory.capacity_chars(MemoryType::Recall),
                settings.overflow_threshold,
            ),
            ConversationMemory::new(
                self.agent.conversation_page_size,
                estimator.capacity_chars(settings.conversation_history_tokens),
            ),
        )
    }

    async fn drive(
        &self,
        request: TurnRequest,
        outbox: Outbox,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        let history = self
            .persistence
            .history(request.user.id, request.conversation_id)
            .await?;
        let blocks = self.memory.all_blocks(request.user.id).await?;

        let mut state = self.new_state(request, outbox.clone());
        state.conversation.extend(history);
        for block in blocks.into_values() {
            state.load_memory_block(block);
        }
        state.push_message(Message::user(state.user_message.clone()));
        tracing::info!(
            conversation = %state.conversation_id,
            user = %state.user.name,
            history = state.conversation.len(),
            "turn started"
        );

        let result = self.run_loop(&mut state, &outbox, cancel).await;
        remove_temp_files(&state.filepaths).await;
        result
    }

    async fn run_loop(
        &self,
        state: &mut TurnState,
        outbox: &Outbox,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        loop {
            if cancel.is_cancelled() || outbox.is_closed() {
                return Err(AgentError::Cancelled);
            }
            if state.epoch_count >= self.agent.max_epochs {
                return self.force_final(state).await;
            }

            state.prompt = self.prompts.build(state);
            tracing::debug!(epoch = state.epoch_count, prompt = %state.prompt, "prompt built");
            outbox.titled(Stage::Analysis, "Thinking...", "");

            let prompt = state.prompt.clone();
            let fragments = self.invoke(&prompt, cancel).await?;
            for fragment in &fragments {
                outbox.stage(Stage::Reasoning, fragment.clone());
            }
            state.last_model_output = fragments.concat();
            state.epoch_count += 1;
            tracing::debug!(epoch = state.epoch_count, output = %state.last_model_output, "model output");

            let mut fallback = false;
            let thought = match self.prompts.parser().parse(&state.last_model_output) {
                Ok(thought) => {
                    state.retry_count = 0;
                    thought
                }
                Err(e) => {
                    state.retry_count += 1;
                    tracing::warn!(error = %e, retry = state.retry_count, "could not parse model output");
                    if let RecoveryAction::RetryWithPrompt(note) = self.recovery.handle(&e) {
                        state.working.add_note(note);
                    }
                    if state.retry_count < self.agent.retry_ceiling {
                        continue;
                    }
                    fallback = true;
                    fallback_thought()
                }
            };
            if !thought.thought.is_empty() {
                outbox.titled(Stage::Planning, "Reflecting...", thought.thought.clone());
            }
            state.pending_thought = Some(thought.clone());

            let fingerprint = thought.action.fingerprint();
            if state.last_tool_call.as_ref() == Some(&fingerprint) {
                tracing::warn!(tool = %fingerprint.name, "duplicate tool call");
                state.duplicate_notice = Some(format!(
                    "Your last action repeated `{}` with identical params. Use the previous result instead of calling it again.",
                    fingerprint.name
                ));
            } else {
                state.duplicate_notice = None;
            }

            let dispatched = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.dispatcher.dispatch(state, &thought) => r,
            };
            let result = match dispatched {
                Ok(result) => result,
                Err(e) => match self.recovery.handle(&e) {
                    RecoveryAction::Observe(note) | RecoveryAction::RetryWithPrompt(note) => {
                        tracing::warn!(error = %e, tool = %thought.action.name, "dispatch failed");
                        state.working.add_note(note.clone());
                        ActionResult::failure(&thought.thought, &thought.action.name, note)
                    }
                    RecoveryAction::ForceFinal(_) => return self.force_final(state).await,
                    RecoveryAction::Abort => return Err(e),
                },
            };
            state.working.push_observation(result.clone());
            state.last_tool_call = Some(fingerprint);

            if result.is_error {
                state.phase = Phase::NeedTool;
                state.push_message(Message::tool(format!("{} failed: {}", result.action, result.result)));
                continue;
            }

            if thought.action.name == SEND_MESSAGE {
                state.phase = Phase::NeedFinal;
                return self.finalize(state, &result.result, fallback).await;
            }

            if thought.action.request_heartbeat {
                state.phase = Phase::NeedTool;
                state.push_message(Message::assistant(action_json(&thought.action)));
                state.push_message(Message::tool(result.result));
                tracing::info!(epoch = state.epoch_count, tool = %thought.action.name, "heartbeat requested");
                continue;
            }

            if state.epoch_count >= self.agent.max_epochs {
                return self.force_final(state).await;
            }
            state.phase = Phase::Error;
            tracing::info!(tool = %thought.action.name, "action without heartbeat, answering directly");
            return self.direct_answer(state, outbox, cancel).await;
        }
    }

    /// 调用模型并返回本次成功尝试的全部片段；限流时按 RetryConfig 重试，仍限流则返回 TransientProvider。
    /// 失败尝试中已收到的片段直接丢弃，不会进入 outbox
    async fn invoke(&self, prompt: &str, cancel: &CancellationToken) -> Result<Vec<String>, AgentError> {
        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.stream_once(prompt) => r,
            };
            match outcome {
                Ok(fragments) => return Ok(fragments),
                Err(e) if e.is_throttling() && attempt < self.throttle.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        delay_ms = self.throttle.delay.as_millis() as u64,
                        "model throttled, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(self.throttle.delay) => {}
                    }
                }
                Err(e) if e.is_throttling() => return Err(AgentError::TransientProvider(e.to_string())),
                Err(e) => return Err(AgentError::Llm(e)),
            }
        }
    }

    async fn stream_once(&self, prompt: &str) -> Result<Vec<String>, LlmError> {
        let mut stream = self.llm.stream(prompt).await?;
        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next().await {
            fragments.push(fragment?);
        }
        Ok(fragments)
    }

    /// 按行输出最终回复（保留换行），记录并持久化，清空本轮 Observation
    async fn finalize(
        &self,
        state: &mut TurnState,
        answer: &str,
        fallback: bool,
    ) -> Result<TurnResult, AgentError> {
        let mut lines = answer.split_inclusive('\n');
        let first = lines.next().unwrap_or_default();
        state.outbox.titled(Stage::Final, "Final Answer", first);
        for line in lines {
            state.outbox.stage(Stage::Final, line);
        }
        self.complete(state, answer, fallback).await
    }

    async fn complete(
        &self,
        state: &mut TurnState,
        answer: &str,
        fallback: bool,
    ) -> Result<TurnResult, AgentError> {
        state.push_message(Message::assistant(answer));
        let result = state.to_result(answer, fallback);
        self.persistence.persist(&result).await?;
        self.memory
            .archive_exchange(
                state.user.id,
                state.conversation_id,
                &[Message::user(state.user_message.clone()), Message::assistant(answer)],
            )
            .await?;
        state.working.clear();
        Ok(result)
    }

    /// 轮次上限：用最近一次成功结果或致歉语收尾
    async fn force_final(&self, state: &mut TurnState) -> Result<TurnResult, AgentError> {
        if let RecoveryAction::ForceFinal(reason) = self.recovery.handle(&AgentError::RunawayLoop(state.epoch_count)) {
            tracing::warn!(reason = %reason, "forcing final answer");
        }
        let answer = match state.working.last_success() {
            Some(obs) => format!("Here is what I found so far:\n\n{}", obs.result),
            None => EPOCH_FALLBACK.to_string(),
        };
        state.phase = Phase::NeedFinal;
        self.finalize(state, &answer, true).await
    }

    /// Error 路径：只带最近几条消息与问题，再调用一次模型直接作答
    async fn direct_answer(
        &self,
        state: &mut TurnState,
        outbox: &Outbox,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        let prompt = self.prompts.build_direct_answer(state, self.agent.error_path_history);
        tracing::debug!(prompt = %prompt, "direct answer prompt");
        let fragments = self.invoke(&prompt, cancel).await?;
        state.epoch_count += 1;
        outbox.titled(Stage::Final, "Final Answer", "");
        for fragment in &fragments {
            outbox.stage(Stage::Final, fragment.clone());
        }
        self.complete(state, fragments.concat().trim(), false).await
    }
}

fn fallback_thought() -> AgentThought {
    let mut params = Map::new();
    params.insert("message".to_string(), Value::String(PARSE_FALLBACK.to_string()));
    AgentThought {
        thought: String::new(),
        action: Action::new(SEND_MESSAGE, params),
    }
}

/// 删除本轮工具产生的临时文件
async fn remove_temp_files(paths: &[String]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(%path, "temporary file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(%path, error = %e, "could not remove temporary file"),
        }
    }
}

fn action_json(action: &Action) -> String {
    serde_json::to_string(action).unwrap_or_else(|_| action.name.clone())
}
