//! 唯一块记忆工具：每个用户每类记忆只有一个块
//!
//! memory_block_upsert / replace / read / append / delete，写入结果同步到当前 Turn 的工作上下文。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ActionResult, TurnState};
use crate::memory::MemoryManager;
use crate::tools::memory_pages::memory_type;
use crate::tools::schema::params_schema;
use crate::tools::{parse_args, Tool, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BlockUpsertParams {
    /// persona, user_profile, recall, summary, archival or system
    pub memory_type: String,
    /// Full new content of the block
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BlockReplaceParams {
    pub memory_type: String,
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BlockTypeParams {
    pub memory_type: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BlockAppendParams {
    pub memory_type: String,
    pub text: String,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    "\n".to_string()
}

macro_rules! block_tool {
    ($ty:ident) => {
        pub struct $ty {
            memory: Arc<MemoryManager>,
        }

        impl $ty {
            pub fn new(memory: Arc<MemoryManager>) -> Self {
                Self { memory }
            }
        }
    };
}

block_tool!(BlockUpsertTool);
block_tool!(BlockReplaceTool);
block_tool!(BlockReadTool);
block_tool!(BlockAppendTool);
block_tool!(BlockDeleteTool);

#[async_trait]
impl Tool for BlockUpsertTool {
    fn name(&self) -> &str {
        "memory_block_upsert"
    }

    fn description(&self) -> &str {
        "Create or overwrite the single block of a memory type."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<BlockUpsertParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: BlockUpsertParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        let block = self.memory.upsert(state.user.id, ty, &params.content).await?;
        state.set_memory_block(block);
        Ok(ActionResult::success(thought, self.name(), format!("{ty} memory block saved.")))
    }
}

#[async_trait]
impl Tool for BlockReplaceTool {
    fn name(&self) -> &str {
        "memory_block_replace"
    }

    fn description(&self) -> &str {
        "Replace exact text inside the block of a memory type."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<BlockReplaceParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: BlockReplaceParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        let block = self
            .memory
            .replace(state.user.id, ty, &params.old_text, &params.new_text)
            .await?;
        state.set_memory_block(block);
        Ok(ActionResult::success(thought, self.name(), format!("{ty} memory block updated.")))
    }
}

#[async_trait]
impl Tool for BlockReadTool {
    fn name(&self) -> &str {
        "memory_block_read"
    }

    fn description(&self) -> &str {
        "Read the block of a memory type into your working context."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<BlockTypeParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: BlockTypeParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        match self.memory.read(state.user.id, ty).await? {
            Some(block) => {
                let content = block.content.clone();
                state.set_memory_block(block);
                Ok(ActionResult::success(thought, self.name(), content))
            }
            None => Ok(ActionResult::success(
                thought,
                self.name(),
                format!("No {ty} memory block exists yet."),
            )),
        }
    }
}

#[async_trait]
impl Tool for BlockAppendTool {
    fn name(&self) -> &str {
        "memory_block_append"
    }

    fn description(&self) -> &str {
        "Append text to the block of a memory type, creating it when absent."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<BlockAppendParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: BlockAppendParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        let block = self
            .memory
            .append(state.user.id, ty, &params.text, &params.separator)
            .await?;
        state.set_memory_block(block);
        Ok(ActionResult::success(thought, self.name(), format!("Appended to {ty} memory block.")))
    }
}

#[async_trait]
impl Tool for BlockDeleteTool {
    fn name(&self) -> &str {
        "memory_block_delete"
    }

    fn description(&self) -> &str {
        "Delete the block of a memory type."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<BlockTypeParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: BlockTypeParams = parse_args(args)?;
        let ty = memory_type(&params.memory_type)?;
        let deleted = self.memory.delete(state.user.id, ty).await?;
        state.memory_blocks.remove(&ty);
        let msg = if deleted {
            format!("{ty} memory block deleted.")
        } else {
            format!("No {ty} memory block to delete.")
        };
        Ok(ActionResult::success(thought, self.name(), msg))
    }
}
