//! 任务清单工具：create_task / list_tasks / complete_task
//!
//! 清单按用户隔离，存放在运行时共享的 TaskBoard 中，跨 Turn 保留。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::{ActionResult, TurnState};
use crate::tools::schema::params_schema;
use crate::tools::{parse_args, Tool, ToolError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskItem {
    /// Your own identifier for the task
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompleteTaskParams {
    pub id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoParams {}

/// 每个用户一份有序任务清单
#[derive(Debug, Default)]
pub struct TaskBoard {
    lists: Mutex<HashMap<Uuid, Vec<TaskItem>>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增任务；id 已存在时覆盖该任务
    pub async fn add(&self, user: Uuid, item: TaskItem) -> Vec<TaskItem> {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(user).or_default();
        match list.iter_mut().find(|t| t.id == item.id) {
            Some(existing) => *existing = item,
            None => list.push(item),
        }
        list.clone()
    }

    pub async fn list(&self, user: Uuid) -> Vec<TaskItem> {
        self.lists.lock().await.get(&user).cloned().unwrap_or_default()
    }

    /// 标记完成；id 不存在时返回 None
    pub async fn complete(&self, user: Uuid, id: &str) -> Option<Vec<TaskItem>> {
        let mut lists = self.lists.lock().await;
        let list = lists.get_mut(&user)?;
        let item = list.iter_mut().find(|t| t.id == id)?;
        item.status = TaskStatus::Completed;
        Some(list.clone())
    }
}

fn plan(items: &[TaskItem]) -> String {
    format!("Plan: {}", serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()))
}

pub struct CreateTaskTool {
    board: Arc<TaskBoard>,
}

impl CreateTaskTool {
    pub fn new(board: Arc<TaskBoard>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Tool for CreateTaskTool {
    fn name(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Add a task to your todo list with an id you choose."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<TaskItem>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let item: TaskItem = parse_args(args)?;
        if item.id.trim().is_empty() || item.task.trim().is_empty() {
            return Err(ToolError::InvalidParameters("id and task must not be empty".to_string()));
        }
        let items = self.board.add(state.user.id, item).await;
        Ok(ActionResult::success(thought, self.name(), plan(&items)))
    }
}

pub struct ListTasksTool {
    board: Arc<TaskBoard>,
}

impl ListTasksTool {
    pub fn new(board: Arc<TaskBoard>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Tool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "Return the current todo list."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<NoParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, _args: Value) -> Result<ActionResult, ToolError> {
        let items = self.board.list(state.user.id).await;
        Ok(ActionResult::success(thought, self.name(), plan(&items)))
    }
}

pub struct CompleteTaskTool {
    board: Arc<TaskBoard>,
}

impl CompleteTaskTool {
    pub fn new(board: Arc<TaskBoard>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Tool for CompleteTaskTool {
    fn name(&self) -> &str {
        "complete_task"
    }

    fn description(&self) -> &str {
        "Mark a task complete once it is done."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<CompleteTaskParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: CompleteTaskParams = parse_args(args)?;
        match self.board.complete(state.user.id, &params.id).await {
            Some(items) => Ok(ActionResult::success(thought, self.name(), plan(&items))),
            None => Err(ToolError::Failed(format!("no task with id '{}'", params.id))),
        }
    }
}
