//! 分页记忆工具：memory_append / memory_read / memory_replace / memory_evict
//!
//! 每类记忆由多页组成，页码按创建顺序从 1 开始；读取时按与 query 的相似度排序。
//! 读到或写入的页会被放进当前 Turn 的工作上下文。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ActionResult, TurnState};
use crate::memory::{MemoryManager, MemoryType, PageEviction};
use crate::tools::schema::params_schema;
use crate::tools::{parse_args, Tool, ToolError};

pub(crate) fn memory_type(raw: &str) -> Result<MemoryType, ToolError> {
    raw.parse::<MemoryType>().map_err(ToolError::InvalidParameters)
}

fn first_page() -> usize {
    1
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryAppendParams {
    /// persona, user_profile, recall, summary, archival or system
    pub memory_type: String,
    pub text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryReadParams {
    pub memory_type: String,
    /// Pages are ranked by similarity to this text
    #[serde(default)]
    pub query: String,
    #[serde(default = "first_page")]
    pub page: usize,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryReplaceParams {
    pub memory_type: String,
    /// Page number in creation order
    pub page: usize,
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryEvictParams {
    pub memory_type: String,
    /// Page number in creation order
    pub page: usize,
    /// Exact text to remove from the page
    pub text: String,
}

pub struct MemoryAppendTool {
    memory: Arc<MemoryManager>,
}

impl MemoryAppendTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryAppendTool {
    fn name(&self) -> &str {
        "memory_append"
    }

    fn description(&self) -> &str {
        "Append text to a memory type. A new page is opened when the latest page is full."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<MemoryAppendParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: MemoryAppendParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        let written = self.memory.page_append(state.user.id, ty, &params.text).await?;
        let page = written.page;
        let total = written.total_pages;
        let mut tokens = 0;
        if let Some(block) = written.results.into_iter().next() {
            tokens = self.memory.token_count(&block.content);
            state.load_memory_block(block);
        }
        Ok(ActionResult::success(
            thought,
            self.name(),
            format!(
                "Appended to {ty} memory page {page} of {total} ({tokens}/{} tokens used on this page).",
                self.memory.settings().page_token_budget
            ),
        ))
    }
}

pub struct MemoryReadTool {
    memory: Arc<MemoryManager>,
}

impl MemoryReadTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        "memory_read"
    }

    fn description(&self) -> &str {
        "Read one page of a memory type, pages ranked by similarity to `query`. The page is loaded into your working context."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<MemoryReadParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: MemoryReadParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        let found = self
            .memory
            .page_read(state.user.id, ty, &params.query, params.page)
            .await?;

        let content = found.results.first().map(|b| b.content.clone());
        if let Some(block) = found.results.into_iter().next() {
            state.load_memory_block(block);
        }
        let body = serde_json::json!({
            "memory_type": ty.as_str(),
            "content": content,
            "page": found.page,
            "total_pages": found.total_pages,
            "total_count": found.total_count,
        });
        Ok(ActionResult::success(thought, self.name(), body.to_string()))
    }
}

pub struct MemoryReplaceTool {
    memory: Arc<MemoryManager>,
}

impl MemoryReplaceTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryReplaceTool {
    fn name(&self) -> &str {
        "memory_replace"
    }

    fn description(&self) -> &str {
        "Replace exact text on one page (creation order) of a memory type."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<MemoryReplaceParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: MemoryReplaceParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        let block = self
            .memory
            .page_replace(state.user.id, ty, params.page, &params.old_text, &params.new_text)
            .await?;
        state.load_memory_block(block);
        Ok(ActionResult::success(
            thought,
            self.name(),
            format!("Replaced text on {ty} memory page {}.", params.page),
        ))
    }
}

pub struct MemoryEvictTool {
    memory: Arc<MemoryManager>,
}

impl MemoryEvictTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryEvictTool {
    fn name(&self) -> &str {
        "memory_evict"
    }

    fn description(&self) -> &str {
        "Remove exact text from one page (creation order) of a memory type. Emptied pages are deleted."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<MemoryEvictParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: MemoryEvictParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        let remaining = self
            .memory
            .page_evict(state.user.id, ty, params.page, &params.text)
            .await?;
        let result = match remaining {
            PageEviction::Kept(block) => {
                state.load_memory_block(block);
                format!("Evicted text from {ty} memory page {}.", params.page)
            }
            PageEviction::Removed(id) => {
                state.unload_memory_block(ty, id);
                format!("Page {} of {ty} memory is now empty and was removed.", params.page)
            }
        };
        Ok(ActionResult::success(thought, self.name(), result))
    }
}
