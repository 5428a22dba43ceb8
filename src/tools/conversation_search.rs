//! conversation_search：在用户归档的历史会话中做相似度检索
//!
//! 命中的消息放入 TurnState.recall（受 Recall 配额约束，溢出时 FIFO 淘汰）。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ActionResult, TurnState};
use crate::memory::MemoryManager;
use crate::tools::schema::params_schema;
use crate::tools::{parse_args, Tool, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConversationSearchParams {
    /// What to look for in past conversations
    pub query: String,
    /// 1-indexed result page
    #[serde(default = "first_page")]
    pub page: usize,
}

fn first_page() -> usize {
    1
}

pub struct ConversationSearchTool {
    memory: Arc<MemoryManager>,
}

impl ConversationSearchTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for ConversationSearchTool {
    fn name(&self) -> &str {
        "conversation_search"
    }

    fn description(&self) -> &str {
        "Search past conversation messages by similarity to `query`. Results are paginated; use `page` to see more."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<ConversationSearchParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: ConversationSearchParams = parse_args(args)?;
        let found = self
            .memory
            .search_conversation(state.user.id, &params.query, params.page)
            .await?;

        if found.results.is_empty() {
            return Ok(ActionResult::success(thought, self.name(), "[]"));
        }

        let lines: Vec<String> = found.results.iter().map(|m| m.message.formatted()).collect();
        for hit in found.results {
            state.recall.push(hit.message);
        }

        let body = serde_json::json!({
            "results": lines,
            "page": found.page,
            "total_pages": found.total_pages,
            "total_count": found.total_count,
        });
        Ok(ActionResult::success(thought, self.name(), body.to_string()))
    }
}
