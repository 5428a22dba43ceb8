//! Agent 构建器：统一的初始化逻辑
//!
//! 按配置组装工具注册表（记忆纪律决定注册哪组记忆工具）、分发器与 Orchestrator。
//! 所有外部协作方（模型、存储、嵌入、持久化）都由调用方注入。

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, MemoryDiscipline};
use crate::llm::{EmbeddingProvider, LlmClient, RetryConfig};
use crate::memory::{MemoryManager, MemoryStore, TurnPersistence};
use crate::react::Orchestrator;
use crate::tools::{
    BlockAppendTool, BlockDeleteTool, BlockReadTool, BlockReplaceTool, BlockUpsertTool, CodeRunnerTool,
    CompleteTaskTool, ConversationSearchTool, CreateTaskTool, DownloadWebpageTool, ListTasksTool,
    MemoryAppendTool, MemoryEvictTool, MemoryReadTool, MemoryReplaceTool, SendMessageTool, TaskBoard,
    ToolCategory, ToolDispatcher, ToolRegistry,
};

pub struct AgentBuilder {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    persistence: Arc<dyn TurnPersistence>,
    tasks: Arc<TaskBoard>,
}

impl AgentBuilder {
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        persistence: Arc<dyn TurnPersistence>,
    ) -> Self {
        Self {
            config,
            llm,
            store,
            embedder,
            persistence,
            tasks: Arc::new(TaskBoard::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build_memory(&self) -> Arc<MemoryManager> {
        Arc::new(MemoryManager::new(
            self.store.clone(),
            self.embedder.clone(),
            self.config.memory.clone(),
        ))
    }

    /// 构建工具注册表
    pub fn build_tool_registry(&self, memory: &Arc<MemoryManager>) -> ToolRegistry {
        let tools_cfg = &self.config.tools;
        let mut tools = ToolRegistry::new();

        tools.register(ToolCategory::Core, SendMessageTool);
        tools.register(ToolCategory::Core, ConversationSearchTool::new(memory.clone()));

        match self.config.memory.discipline {
            MemoryDiscipline::Paginated => {
                tools.register(ToolCategory::Memory, MemoryAppendTool::new(memory.clone()));
                tools.register(ToolCategory::Memory, MemoryReadTool::new(memory.clone()));
                tools.register(ToolCategory::Memory, MemoryReplaceTool::new(memory.clone()));
                tools.register(ToolCategory::Memory, MemoryEvictTool::new(memory.clone()));
            }
            MemoryDiscipline::Unique => {
                tools.register(ToolCategory::Memory, BlockUpsertTool::new(memory.clone()));
                tools.register(ToolCategory::Memory, BlockReplaceTool::new(memory.clone()));
                tools.register(ToolCategory::Memory, BlockReadTool::new(memory.clone()));
                tools.register(ToolCategory::Memory, BlockAppendTool::new(memory.clone()));
                tools.register(ToolCategory::Memory, BlockDeleteTool::new(memory.clone()));
            }
        }

        tools.register(
            ToolCategory::Code,
            CodeRunnerTool::new(tools_cfg.python_interpreter.clone(), tools_cfg.code_timeout_secs),
        );
        tools.register(
            ToolCategory::Integration,
            DownloadWebpageTool::new(
                tools_cfg.fetch_timeout_secs,
                tools_cfg.max_fetch_chars,
                tools_cfg.temp_dir.clone(),
            ),
        );
        tools.register(ToolCategory::Misc, CreateTaskTool::new(self.tasks.clone()));
        tools.register(ToolCategory::Misc, ListTasksTool::new(self.tasks.clone()));
        tools.register(ToolCategory::Misc, CompleteTaskTool::new(self.tasks.clone()));

        tracing::info!(
            tools = tools.len(),
            discipline = ?self.config.memory.discipline,
            "tool registry built"
        );
        tools
    }

    /// 构建 Orchestrator（注册表使用默认工具集）
    pub fn build(self) -> Orchestrator {
        let memory = self.build_memory();
        let registry = self.build_tool_registry(&memory);
        self.build_with_registry(memory, registry)
    }

    /// 使用自定义注册表构建（测试或嵌入方扩展工具时）
    pub fn build_with_registry(self, memory: Arc<MemoryManager>, registry: ToolRegistry) -> Orchestrator {
        let dispatcher = Arc::new(ToolDispatcher::new(registry, self.config.tools.tool_timeout_secs));
        Orchestrator::new(self.llm, dispatcher, memory, self.persistence)
            .with_agent_config(&self.config.agent)
            .with_memory_config(&self.config.memory)
            .with_system_prompt(self.config.app.system_prompt.clone())
            .with_throttle_retry(RetryConfig::new(
                1,
                Duration::from_millis(self.config.llm.throttle_retry_delay_ms),
            ))
    }
}
