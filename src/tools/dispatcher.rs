//! 工具分发器
//!
//! 持有 ToolRegistry 与全局超时：未知工具返回 UnknownTool，参数不合法返回 InvalidParameters；
//! 工具自身的失败、panic 与超时都转为 is_error 的 ActionResult，由循环作为 Observation 处理。
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::{ActionResult, AgentError, TurnState};
use crate::react::AgentThought;
use crate::tools::{ToolError, ToolRegistry};

pub struct ToolDispatcher {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub async fn dispatch(&self, state: &mut TurnState, thought: &AgentThought) -> Result<ActionResult, AgentError> {
        let name = thought.action.name.as_str();
        let tool = self.registry.get(name).ok_or_else(|| AgentError::UnknownTool {
            name: name.to_string(),
            available: self.registry.tool_names().join(", "),
        })?;

        let args = Value::Object(thought.action.params.clone());
        let preview = args_preview(&args);
        let start = Instant::now();
        let result = timeout(
            self.timeout,
            AssertUnwindSafe(tool.execute(state, &thought.thought, args)).catch_unwind(),
        )
        .await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(Ok(r))) if !r.is_error => (true, "ok"),
            Ok(Ok(Ok(_))) | Ok(Ok(Err(ToolError::Failed(_)))) => (false, "error"),
            Ok(Ok(Err(ToolError::InvalidParameters(_)))) => (false, "invalid_parameters"),
            Ok(Ok(Err(ToolError::Fatal(_)))) => (false, "fatal"),
            Ok(Err(_)) => (false, "panic"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(Ok(r))) => Ok(r),
            Ok(Ok(Err(ToolError::InvalidParameters(reason)))) => Err(AgentError::InvalidParameters {
                tool: name.to_string(),
                reason,
            }),
            Ok(Ok(Err(ToolError::Failed(msg)))) => Ok(ActionResult::failure(
                &thought.thought,
                name,
                AgentError::ToolExecutionFailed(msg).to_string(),
            )),
            Ok(Ok(Err(ToolError::Fatal(msg)))) => Err(AgentError::FatalInfrastructure(msg)),
            Ok(Err(_)) => Ok(ActionResult::failure(
                &thought.thought,
                name,
                AgentError::ToolExecutionFailed(format!("{name} panicked")).to_string(),
            )),
            Err(_) => Ok(ActionResult::failure(
                &thought.thought,
                name,
                AgentError::ToolTimeout(format!("{name} exceeded {}s", self.timeout.as_secs_f32())).to_string(),
            )),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TurnRequest, User};
    use crate::memory::{ConversationMemory, RecallWindow, WorkingMemory};
    use crate::react::{event_bus, Action};
    use crate::tools::{parse_args, Tool, ToolCategory};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::{json, Map};
    use uuid::Uuid;

    struct Adder;

    #[derive(Deserialize)]
    struct AddParams {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl Tool for Adder {
        fn name(&self) -> &str {
            "add"
        }
        fn description(&self) -> &str {
            "adds two numbers"
        }
        async fn execute(&self, _state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
            let p: AddParams = parse_args(args)?;
            Ok(ActionResult::success(thought, "add", (p.a + p.b).to_string()))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _state: &mut TurnState, _thought: &str, _args: Value) -> Result<ActionResult, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ToolError::Failed("unreachable".into()))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn execute(&self, _state: &mut TurnState, _thought: &str, _args: Value) -> Result<ActionResult, ToolError> {
            Err(ToolError::Failed("disk on fire".into()))
        }
    }

    fn state() -> TurnState {
        let (outbox, _stream) = event_bus();
        TurnState::new(
            TurnRequest::new(Uuid::new_v4(), User::new("u"), "q"),
            outbox,
            WorkingMemory::new(10),
            RecallWindow::new(1000, 0.8),
            ConversationMemory::new(20, 4000),
        )
    }

    fn thought(name: &str, params: Value) -> AgentThought {
        let params: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
        AgentThought {
            thought: "t".into(),
            action: Action::new(name, params),
        }
    }

    fn dispatcher() -> ToolDispatcher {
        let mut reg = ToolRegistry::new();
        reg.register(ToolCategory::Misc, Adder);
        reg.register(ToolCategory::Misc, Sleepy);
        reg.register(ToolCategory::Misc, Broken);
        ToolDispatcher::with_timeout(reg, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let d = dispatcher();
        let mut s = state();
        let r = d.dispatch(&mut s, &thought("add", json!({"a": 2, "b": 2}))).await.unwrap();
        assert_eq!(r.result, "4");
        assert!(!r.is_error);
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_available() {
        let d = dispatcher();
        let mut s = state();
        let err = d.dispatch(&mut s, &thought("fake_tool", json!({}))).await.unwrap_err();
        match err {
            AgentError::UnknownTool { name, available } => {
                assert_eq!(name, "fake_tool");
                assert!(available.contains("add"));
            }
            other => panic!("Expected UnknownTool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_parameters() {
        let d = dispatcher();
        let mut s = state();
        let err = d.dispatch(&mut s, &thought("add", json!({"a": "two"}))).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidParameters { tool, .. } if tool == "add"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_result() {
        let d = dispatcher();
        let mut s = state();
        let r = d.dispatch(&mut s, &thought("sleepy", json!({}))).await.unwrap();
        assert!(r.is_error);
        assert!(r.result.contains("timeout"));
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_result() {
        let d = dispatcher();
        let mut s = state();
        let r = d.dispatch(&mut s, &thought("broken", json!({}))).await.unwrap();
        assert!(r.is_error);
        assert!(r.result.contains("disk on fire"));
    }
}
