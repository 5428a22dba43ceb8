//! Headless Agent 运行时
//!
//! 从配置构建全部组件（模型、内存存储、嵌入、JSON 文件持久化），对外提供
//! spawn_turn（流式）与 process_message（等待最终回复）两种调用方式。

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{load_config, AppConfig};
use crate::core::{create_llm_from_config, spawn_turn, AgentBuilder, AgentError, TurnHandle, TurnRequest, TurnResult, User};
use crate::llm::{create_embedder_from_config, EmbeddingProvider, LlmClient};
use crate::memory::{InMemoryStore, JsonFilePersistence, MemoryManager, MemoryStore, TurnPersistence};
use crate::react::Orchestrator;

pub struct AgentRuntime {
    orchestrator: Arc<Orchestrator>,
}

impl AgentRuntime {
    /// 按配置文件（可选）与环境变量构建运行时
    pub fn from_config(config_path: Option<PathBuf>) -> Result<Self, AgentError> {
        let cfg = load_config(config_path).map_err(|e| AgentError::Config(e.to_string()))?;
        let llm = create_llm_from_config(&cfg);
        let embedder = create_embedder_from_config(
            &cfg.llm.provider,
            cfg.llm.base_url.as_deref(),
            &cfg.llm.embedding_model,
            cfg.llm.api_key.as_deref(),
        );
        let persistence = Arc::new(JsonFilePersistence::new(cfg.app.data_dir.join("conversations")));
        Ok(Self::with_components(
            cfg,
            llm,
            Arc::new(InMemoryStore::new()),
            embedder,
            persistence,
        ))
    }

    pub fn with_components(
        cfg: AppConfig,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        persistence: Arc<dyn TurnPersistence>,
    ) -> Self {
        let orchestrator = AgentBuilder::new(cfg, llm, store, embedder, persistence).build();
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        self.orchestrator.memory()
    }

    /// 启动一个 Turn，返回可流式消费的句柄
    pub fn spawn_turn(&self, conversation_id: Uuid, user: User, message: impl Into<String>) -> TurnHandle {
        spawn_turn(
            self.orchestrator.clone(),
            TurnRequest::new(conversation_id, user, message),
        )
    }

    /// 跑完一个 Turn 并返回结果（忽略中间片段）
    pub async fn process_message(
        &self,
        conversation_id: Uuid,
        user: User,
        message: impl Into<String>,
    ) -> Result<TurnResult, AgentError> {
        self.spawn_turn(conversation_id, user, message).join().await
    }
}
