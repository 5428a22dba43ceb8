//! Turn 场景测试：脚本化 Mock 模型 + 进程内存储 / 持久化，驱动完整主循环

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use memloop::config::AppConfig;
use memloop::core::{spawn_turn, ActionResult, AgentBuilder, AgentError, Phase, TurnRequest, TurnState, User};
use memloop::llm::{HashingEmbedder, LlmError, MockLlmClient, MockReply};
use memloop::memory::{
    ArchivedMessage, InMemoryPersistence, InMemoryStore, MemoryBlock, MemoryError, MemoryStore, MemoryType,
    PaginatedResult,
};
use memloop::react::{Orchestrator, Stage, StreamChunk, PARSE_FALLBACK};
use memloop::tools::{
    params_schema, parse_args, MemoryAppendTool, MemoryEvictTool, SendMessageTool, Tool, ToolCategory, ToolError,
    ToolRegistry,
};

#[derive(Debug, Deserialize, JsonSchema)]
struct AddParams {
    a: i64,
    b: i64,
}

struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two integers"
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<AddParams>()
    }

    async fn execute(&self, _state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let p: AddParams = parse_args(args)?;
        Ok(ActionResult::success(thought, "add", (p.a + p.b).to_string()))
    }
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Takes a long time"
    }

    async fn execute(&self, _state: &mut TurnState, thought: &str, _args: Value) -> Result<ActionResult, ToolError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ActionResult::success(thought, "slow", "done"))
    }
}

/// 在指定目录写一个临时文件并登记到 filepaths
struct ScratchTool {
    dir: std::path::PathBuf,
}

#[async_trait]
impl Tool for ScratchTool {
    fn name(&self) -> &str {
        "scratch"
    }

    fn description(&self) -> &str {
        "Write notes to a temporary file"
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, _args: Value) -> Result<ActionResult, ToolError> {
        let path = self.dir.join(format!("memloop-page-{}.txt", Uuid::new_v4()));
        tokio::fs::write(&path, "notes")
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        let path = path.to_string_lossy().to_string();
        state.filepaths.push(path.clone());
        Ok(ActionResult::success(thought, "scratch", path))
    }
}

/// 所有操作都失败的存储
struct BrokenStore;

#[async_trait]
impl MemoryStore for BrokenStore {
    async fn insert_block(&self, _block: MemoryBlock) -> Result<(), MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
    async fn update_block(&self, _block: &MemoryBlock) -> Result<(), MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
    async fn remove_block(&self, _owner: Uuid, _id: Uuid) -> Result<bool, MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
    async fn delete_blocks(&self, _owner: Uuid, _ty: MemoryType) -> Result<usize, MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
    async fn blocks(&self, _owner: Uuid, _ty: MemoryType) -> Result<Vec<MemoryBlock>, MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
    async fn all_blocks(&self, _owner: Uuid) -> Result<Vec<MemoryBlock>, MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
    async fn search_blocks(
        &self,
        _owner: Uuid,
        _ty: MemoryType,
        _query: Option<&[f32]>,
        _page: usize,
        _page_size: usize,
    ) -> Result<PaginatedResult<MemoryBlock>, MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
    async fn append_messages(&self, _owner: Uuid, _messages: Vec<ArchivedMessage>) -> Result<(), MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
    async fn search_messages(
        &self,
        _owner: Uuid,
        _query: Option<&[f32]>,
        _page: usize,
        _page_size: usize,
    ) -> Result<PaginatedResult<ArchivedMessage>, MemoryError> {
        Err(MemoryError::Backend("connection refused".into()))
    }
}

fn action(thought: &str, name: &str, params: Value, heartbeat: bool) -> String {
    let body = json!({
        "name": name,
        "description": "",
        "params": params,
        "request_heartbeat": heartbeat,
    });
    format!("<inner_monologue>{thought}</inner_monologue>\n<action>\n{body}\n</action>")
}

fn answer(text: &str) -> String {
    action("I can answer now.", "send_message", json!({ "message": text }), false)
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.llm.throttle_retry_delay_ms = 10;
    cfg
}

struct Harness {
    llm: Arc<MockLlmClient>,
    persistence: Arc<InMemoryPersistence>,
    orchestrator: Arc<Orchestrator>,
}

fn harness_with(replies: Vec<MockReply>, cfg: AppConfig, store: Arc<dyn MemoryStore>) -> Harness {
    let llm = Arc::new(MockLlmClient::scripted(replies));
    let persistence = Arc::new(InMemoryPersistence::new());
    let builder = AgentBuilder::new(
        cfg,
        llm.clone(),
        store,
        Arc::new(HashingEmbedder::default()),
        persistence.clone(),
    );
    let memory = builder.build_memory();
    let mut registry = ToolRegistry::new();
    registry.register(ToolCategory::Core, SendMessageTool);
    registry.register(ToolCategory::Code, AddTool);
    registry.register(ToolCategory::Misc, SlowTool);
    registry.register(ToolCategory::Memory, MemoryAppendTool::new(memory.clone()));
    registry.register(ToolCategory::Memory, MemoryEvictTool::new(memory.clone()));
    let orchestrator = Arc::new(builder.build_with_registry(memory, registry));
    Harness {
        llm,
        persistence,
        orchestrator,
    }
}

fn harness(replies: Vec<MockReply>) -> Harness {
    harness_with(replies, test_config(), Arc::new(InMemoryStore::new()))
}

fn request(message: &str) -> TurnRequest {
    TurnRequest::new(Uuid::new_v4(), User::new("tester"), message)
}

fn stage_contents(chunks: &[StreamChunk], stage: Stage) -> Vec<String> {
    chunks
        .iter()
        .filter(|c| c.stage == stage)
        .map(|c| c.content.clone())
        .collect()
}

#[tokio::test]
async fn test_happy_path_single_final_chunk() {
    let h = harness(vec![answer("4").into()]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("What's 2+2?")).collect().await;
    let result = result.unwrap();

    assert_eq!(stage_contents(&chunks, Stage::Final), vec!["4".to_string()]);
    assert!(chunks.last().unwrap().is_end());
    assert_eq!(chunks.iter().filter(|c| c.is_end()).count(), 1);
    assert_eq!(chunks[0].stage, Stage::Analysis);
    assert!(chunks.iter().any(|c| c.stage == Stage::Planning));

    assert_eq!(result.answer, "4");
    assert_eq!(result.phase, Phase::NeedFinal);
    assert!(!result.fallback);
    assert_eq!(h.llm.call_count(), 1);
    assert_eq!(h.persistence.persisted().await.len(), 1);
}

#[tokio::test]
async fn test_tool_chain_feeds_observation_into_next_prompt() {
    let h = harness(vec![
        action("Compute it.", "add", json!({"a": 2, "b": 2}), true).into(),
        answer("2 + 2 = 4").into(),
    ]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("What's 2+2?")).collect().await;

    assert_eq!(result.unwrap().answer, "2 + 2 = 4");
    assert_eq!(h.llm.call_count(), 2);
    let prompts = h.llm.prompts();
    assert!(prompts[1].contains("\"result\": \"4\""));
    assert!(!prompts[0].contains("\"result\": \"4\""));
    assert_eq!(stage_contents(&chunks, Stage::Final), vec!["2 + 2 = 4".to_string()]);
}

#[tokio::test]
async fn test_multiline_answer_streams_one_chunk_per_line() {
    let h = harness(vec![answer("# Title\n\n- a\n- b").into()]);
    let (chunks, _) = spawn_turn(h.orchestrator.clone(), request("list")).collect().await;
    let finals: Vec<&StreamChunk> = chunks.iter().filter(|c| c.stage == Stage::Final).collect();
    let contents: Vec<&str> = finals.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(contents, vec!["# Title\n", "\n", "- a\n", "- b"]);
    assert_eq!(finals[0].stage_title.as_deref(), Some("Final Answer"));
    assert!(finals[1].stage_title.is_none());
}

#[tokio::test]
async fn test_malformed_twice_then_fallback() {
    let h = harness(vec!["I think the answer is 4".into(), "<action>{not json}</action>".into()]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("What's 2+2?")).collect().await;
    let result = result.unwrap();

    assert_eq!(h.llm.call_count(), 2);
    assert!(result.fallback);
    assert_eq!(result.answer, PARSE_FALLBACK);
    assert_eq!(stage_contents(&chunks, Stage::Final), vec![PARSE_FALLBACK.to_string()]);
    let prompts = h.llm.prompts();
    assert!(prompts[1].contains("Validation failed"));
    assert!(prompts[1].contains("no action"));
    assert_eq!(h.persistence.persisted().await.len(), 1);
}

#[tokio::test]
async fn test_duplicate_call_is_flagged_in_next_prompt() {
    let h = harness(vec![
        action("Add.", "add", json!({"a": 1, "b": 2}), true).into(),
        action("Add again.", "add", json!({"b": 2, "a": 1}), true).into(),
        answer("3").into(),
    ]);
    let (_, result) = spawn_turn(h.orchestrator.clone(), request("1+2?")).collect().await;

    assert_eq!(result.unwrap().answer, "3");
    let prompts = h.llm.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(!prompts[1].contains("repeated `add`"));
    assert!(prompts[2].contains("repeated `add`"));
}

#[tokio::test]
async fn test_unknown_tool_becomes_observation() {
    let h = harness(vec![
        action("Try it.", "teleport", json!({}), true).into(),
        answer("cannot").into(),
    ]);
    let (_, result) = spawn_turn(h.orchestrator.clone(), request("go")).collect().await;

    assert_eq!(result.unwrap().answer, "cannot");
    let prompts = h.llm.prompts();
    assert!(prompts[1].contains("Unknown tool: teleport"));
}

#[tokio::test]
async fn test_action_without_heartbeat_takes_error_path() {
    let h = harness(vec![
        action("Add.", "add", json!({"a": 1, "b": 1}), false).into(),
        "It is 2.".into(),
    ]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("1+1?")).collect().await;
    let result = result.unwrap();

    assert_eq!(result.phase, Phase::Error);
    assert_eq!(result.answer, "It is 2.");
    assert_eq!(h.llm.call_count(), 2);
    assert_eq!(stage_contents(&chunks, Stage::Final).concat(), "It is 2.");
    let direct: Value = serde_json::from_str(&h.llm.prompts()[1]).unwrap();
    assert_eq!(direct["current_user_query"], "1+1?");
}

#[tokio::test]
async fn test_epoch_ceiling_forces_final_with_partial_result() {
    let mut cfg = test_config();
    cfg.agent.max_epochs = 2;
    let h = harness_with(
        vec![
            action("Add.", "add", json!({"a": 1, "b": 1}), true).into(),
            action("Add more.", "add", json!({"a": 2, "b": 3}), true).into(),
        ],
        cfg,
        Arc::new(InMemoryStore::new()),
    );
    let (_, result) = spawn_turn(h.orchestrator.clone(), request("keep adding")).collect().await;
    let result = result.unwrap();

    assert_eq!(h.llm.call_count(), 2);
    assert!(result.fallback);
    assert_eq!(result.answer, "Here is what I found so far:\n\n5");
}

#[tokio::test]
async fn test_cancel_stops_loop_and_still_ends() {
    let h = harness(vec![action("Wait.", "slow", json!({}), true).into()]);
    let mut handle = spawn_turn(h.orchestrator.clone(), request("slow please"));

    while let Some(chunk) = handle.next_chunk().await {
        if chunk.stage == Stage::Planning {
            break;
        }
    }
    handle.cancel();

    let (rest, result) = tokio::time::timeout(Duration::from_secs(5), handle.collect())
        .await
        .expect("turn did not stop after cancel");
    assert!(matches!(result, Err(AgentError::Cancelled)));
    assert!(rest.last().unwrap().is_end());
    assert!(rest.iter().all(|c| c.stage != Stage::Error));
    assert_eq!(h.llm.call_count(), 1);
    assert!(h.persistence.persisted().await.is_empty());
}

#[tokio::test]
async fn test_dropping_handle_cancels_turn() {
    let h = harness(vec![action("Wait.", "slow", json!({}), true).into()]);
    let mut handle = spawn_turn(h.orchestrator.clone(), request("slow please"));
    while let Some(chunk) = handle.next_chunk().await {
        if chunk.stage == Stage::Planning {
            break;
        }
    }
    drop(handle);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.llm.call_count(), 1);
    assert!(h.persistence.persisted().await.is_empty());
}

#[tokio::test]
async fn test_fatal_model_error_emits_one_error_chunk() {
    let h = harness(vec![MockReply::Error(LlmError::Api("invalid api key".into()))]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("hi")).collect().await;

    assert!(matches!(result, Err(AgentError::Llm(_))));
    assert_eq!(chunks.iter().filter(|c| c.stage == Stage::Error).count(), 1);
    let n = chunks.len();
    assert_eq!(chunks[n - 2].stage, Stage::Error);
    assert!(chunks[n - 1].is_end());
    assert!(h.persistence.persisted().await.is_empty());
}

#[tokio::test]
async fn test_throttle_once_is_retried() {
    let h = harness(vec![
        MockReply::Error(LlmError::RateLimited { retry_after_ms: 10 }),
        answer("ok").into(),
    ]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("hi")).collect().await;

    assert_eq!(result.unwrap().answer, "ok");
    assert_eq!(h.llm.call_count(), 2);
    assert!(chunks.iter().all(|c| c.stage != Stage::Error));
}

#[tokio::test]
async fn test_mid_stream_throttle_is_retried() {
    let h = harness(vec![
        MockReply::FailMidStream("<inner_monologue>half".into(), LlmError::RateLimited { retry_after_ms: 10 }),
        answer("ok").into(),
    ]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("hi")).collect().await;

    assert_eq!(result.unwrap().answer, "ok");
    assert_eq!(stage_contents(&chunks, Stage::Reasoning).concat(), answer("ok"));
    assert_eq!(stage_contents(&chunks, Stage::Final), vec!["ok".to_string()]);
}

#[tokio::test]
async fn test_throttle_during_direct_answer_streams_answer_once() {
    let h = harness(vec![
        action("Add.", "add", json!({"a": 1, "b": 1}), false).into(),
        MockReply::FailMidStream("The answer is ".into(), LlmError::RateLimited { retry_after_ms: 10 }),
        "The answer is 2.".into(),
    ]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("1+1?")).collect().await;
    let result = result.unwrap();

    assert_eq!(result.phase, Phase::Error);
    assert_eq!(result.answer, "The answer is 2.");
    assert_eq!(stage_contents(&chunks, Stage::Final).concat(), "The answer is 2.");
    assert_eq!(h.persistence.persisted().await[0].answer, "The answer is 2.");
    assert_eq!(h.llm.call_count(), 3);
}

#[tokio::test]
async fn test_direct_answer_respects_epoch_ceiling() {
    let mut cfg = test_config();
    cfg.agent.max_epochs = 1;
    let h = harness_with(
        vec![
            action("Add.", "add", json!({"a": 1, "b": 1}), false).into(),
            "never asked".into(),
        ],
        cfg,
        Arc::new(InMemoryStore::new()),
    );
    let result = spawn_turn(h.orchestrator.clone(), request("1+1?")).join().await.unwrap();

    assert_eq!(h.llm.call_count(), 1);
    assert!(result.fallback);
    assert_eq!(result.answer, "Here is what I found so far:\n\n2");
}

fn prompt_memory_blocks(prompt: &str) -> String {
    let v: Value = serde_json::from_str(prompt).unwrap();
    v["working_context"]["memory_blocks"].to_string()
}

#[tokio::test]
async fn test_memory_edits_show_in_next_prompt() {
    let h = harness(vec![
        action("Remember.", "memory_append", json!({"memory_type": "archival", "text": "alpha secret"}), true).into(),
        action("Forget part.", "memory_evict", json!({"memory_type": "archival", "page": 1, "text": " secret"}), true)
            .into(),
        answer("done").into(),
    ]);
    let result = spawn_turn(h.orchestrator.clone(), request("remember alpha")).join().await;
    assert_eq!(result.unwrap().answer, "done");

    let prompts = h.llm.prompts();
    assert!(!prompt_memory_blocks(&prompts[0]).contains("alpha"));
    assert!(prompt_memory_blocks(&prompts[1]).contains("alpha secret"));
    let after_evict = prompt_memory_blocks(&prompts[2]);
    assert!(after_evict.contains("alpha"));
    assert!(!after_evict.contains("secret"));
}

#[tokio::test]
async fn test_temporary_files_removed_when_turn_ends() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::scripted(vec![
        MockReply::from(action("Take notes.", "scratch", json!({}), true)),
        answer("noted").into(),
    ]));
    let builder = AgentBuilder::new(
        test_config(),
        llm.clone(),
        Arc::new(InMemoryStore::new()),
        Arc::new(HashingEmbedder::default()),
        Arc::new(InMemoryPersistence::new()),
    );
    let memory = builder.build_memory();
    let mut registry = ToolRegistry::new();
    registry.register(ToolCategory::Core, SendMessageTool);
    registry.register(
        ToolCategory::Misc,
        ScratchTool {
            dir: dir.path().to_path_buf(),
        },
    );
    let orchestrator = Arc::new(builder.build_with_registry(memory, registry));

    let result = spawn_turn(orchestrator, request("take notes")).join().await;
    assert_eq!(result.unwrap().answer, "noted");
    assert!(llm.prompts()[1].contains("memloop-page-"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_throttle_twice_surfaces_error() {
    let h = harness(vec![
        MockReply::Error(LlmError::RateLimited { retry_after_ms: 10 }),
        MockReply::Error(LlmError::RateLimited { retry_after_ms: 10 }),
        answer("never").into(),
    ]);
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("hi")).collect().await;

    assert!(matches!(result, Err(AgentError::TransientProvider(_))));
    assert_eq!(h.llm.call_count(), 2);
    assert_eq!(stage_contents(&chunks, Stage::Error).len(), 1);
    assert!(chunks.last().unwrap().is_end());
}

#[tokio::test]
async fn test_store_failure_is_fatal() {
    let h = harness_with(vec![answer("4").into()], test_config(), Arc::new(BrokenStore));
    let (chunks, result) = spawn_turn(h.orchestrator.clone(), request("hi")).collect().await;

    assert!(matches!(result, Err(AgentError::FatalInfrastructure(_))));
    assert_eq!(h.llm.call_count(), 0);
    assert_eq!(stage_contents(&chunks, Stage::Error).len(), 1);
    assert!(chunks.last().unwrap().is_end());
}

#[tokio::test]
async fn test_yaml_output_format() {
    let mut cfg = test_config();
    cfg.agent.output_format = memloop::react::OutputFormat::Yaml;
    let yaml = "<inner_monologue>Reply.</inner_monologue>\n<action>\nname: send_message\nparams:\n  message: hello from yaml\n</action>";
    let h = harness_with(vec![yaml.into()], cfg, Arc::new(InMemoryStore::new()));
    let result = spawn_turn(h.orchestrator.clone(), request("hi")).join().await.unwrap();

    assert_eq!(result.answer, "hello from yaml");
    assert!(h.llm.prompts()[0].contains("\"format\": \"yaml\""));
}

#[tokio::test]
async fn test_history_carries_into_next_turn() {
    let h = harness(vec![answer("Nice to meet you, Ada.").into(), answer("You are Ada.").into()]);
    let user = User::new("ada");
    let conversation = Uuid::new_v4();

    spawn_turn(
        h.orchestrator.clone(),
        TurnRequest::new(conversation, user.clone(), "My name is Ada"),
    )
    .join()
    .await
    .unwrap();
    spawn_turn(
        h.orchestrator.clone(),
        TurnRequest::new(conversation, user, "What is my name?"),
    )
    .join()
    .await
    .unwrap();

    let prompts = h.llm.prompts();
    assert!(prompts[1].contains("My name is Ada"));
    assert!(prompts[1].contains("Nice to meet you, Ada."));
}
