//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册、
//! 按类别分组生成 prompt 中的动作目录。注册与移除都是显式调用，不做反射发现。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::{ActionResult, AgentError, TurnState};

/// 工具类别（prompt 中按类别分组展示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Core,
    Memory,
    Integration,
    Code,
    Misc,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidParameters(String),
    #[error("{0}")]
    Failed(String),
    /// 存储等基础设施不可用，需要终止整个 Turn
    #[error("{0}")]
    Fatal(String),
}

impl From<AgentError> for ToolError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::FatalInfrastructure(msg) => ToolError::Fatal(msg),
            AgentError::InvalidParameters { reason, .. } => ToolError::InvalidParameters(reason),
            other => ToolError::Failed(other.to_string()),
        }
    }
}

/// 工具 trait：名称、描述、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema（默认为无参数对象）
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；可通过 state 写入召回结果、临时文件等
    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError>;
}

/// 将 JSON 参数反序列化为工具的类型化参数（null 视为空对象）
pub fn parse_args<P: DeserializeOwned>(args: Value) -> Result<P, ToolError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidParameters(e.to_string()))
}

/// 目录中单个工具的描述
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

struct RegisteredTool {
    category: ToolCategory,
    tool: Arc<dyn Tool>,
}

/// 工具注册表：按名称存储 Arc<dyn Tool> 及其类别
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, category: ToolCategory, tool: impl Tool + 'static) {
        self.register_arc(category, Arc::new(tool));
    }

    pub fn register_arc(&mut self, category: ToolCategory, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            tracing::warn!(tool = %name, "tool re-registered, replacing previous handler");
        }
        self.tools.insert(name, RegisteredTool { category, tool });
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| r.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn category_of(&self, name: &str) -> Option<ToolCategory> {
        self.tools.get(name).map(|r| r.category)
    }

    /// 已注册的工具名（字典序）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按类别分组的动作目录
    pub fn catalogue(&self) -> BTreeMap<ToolCategory, Vec<ToolSpec>> {
        let mut out: BTreeMap<ToolCategory, Vec<ToolSpec>> = BTreeMap::new();
        for (name, reg) in &self.tools {
            out.entry(reg.category).or_default().push(ToolSpec {
                name: name.clone(),
                description: reg.tool.description().to_string(),
                parameters: reg.tool.parameters_schema(),
            });
        }
        for specs in out.values_mut() {
            specs.sort_by(|a, b| a.name.cmp(&b.name));
        }
        out
    }

    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.catalogue()).unwrap_or_else(|_| "{}".to_string())
    }
}
