//! Response Parser：从模型输出中提取内心独白与唯一的 action
//!
//! 协议：`<inner_monologue>…</inner_monologue>`（可选）+ 恰好一个 `<action>…</action>`。
//! action 内容按配置的格式（JSON / YAML）反序列化，不做格式探测；工具名是否存在留给分发阶段判断。

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::AgentError;

pub const MONOLOGUE_TAG: &str = "inner_monologue";
pub const ACTION_TAG: &str = "action";

/// action 块的结构化格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
        }
    }
}

fn params_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Map<String, Value>, D::Error> {
    Ok(Option::<Map<String, Value>>::deserialize(d)?.unwrap_or_default())
}

/// 模型选择的动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "params_or_empty")]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub request_heartbeat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_for_heartbeat: Option<String>,
}

impl Action {
    pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            params,
            request_heartbeat: false,
            reason_for_heartbeat: None,
        }
    }

    pub fn with_heartbeat(mut self, reason: impl Into<String>) -> Self {
        self.request_heartbeat = true;
        self.reason_for_heartbeat = Some(reason.into());
        self
    }

    pub fn fingerprint(&self) -> ToolCallFingerprint {
        ToolCallFingerprint::of(&self.name, &self.params)
    }
}

/// 工具调用指纹：(工具名, 规范化参数的 SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolCallFingerprint {
    pub name: String,
    pub params_hash: String,
}

impl ToolCallFingerprint {
    pub fn of(name: &str, params: &Map<String, Value>) -> Self {
        let mut canonical = String::new();
        write_canonical(&Value::Object(params.clone()), &mut canonical);
        Self {
            name: name.to_string(),
            params_hash: format!("{:x}", Sha256::digest(canonical.as_bytes())),
        }
    }
}

/// 键排序后的紧凑 JSON，与 Map 的内部顺序无关
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String((*key).clone()));
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}

/// 解析结果：内心独白 + 动作
#[derive(Debug, Clone, PartialEq)]
pub struct AgentThought {
    pub thought: String,
    pub action: Action,
}

static MONOLOGUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<inner_monologue>(.*?)</inner_monologue>").expect("monologue pattern"));
static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<action>(.*?)</action>").expect("action pattern"));

/// 提取标签之间的全部内容（跨行，非贪婪）
fn tag_contents(re: &Regex, text: &str) -> Vec<String> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}

fn strip_fence<'a>(body: &'a str, lang: &str) -> &'a str {
    let trimmed = body.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix(lang).unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    format: OutputFormat,
}

impl ResponseParser {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn parse(&self, output: &str) -> Result<AgentThought, AgentError> {
        let thought = tag_contents(&MONOLOGUE_RE, output).join("\n");

        let mut actions = tag_contents(&ACTION_RE, output);
        let body = match actions.len() {
            0 => return Err(AgentError::ParseFailure("no action".to_string())),
            1 => actions.remove(0),
            n => {
                return Err(AgentError::ParseFailure(format!(
                    "multiple actions ({n} <action> blocks)"
                )))
            }
        };

        let action: Action = match self.format {
            OutputFormat::Json => serde_json::from_str(strip_fence(&body, "json"))
                .map_err(|e| AgentError::ParseFailure(format!("invalid json action: {e}")))?,
            OutputFormat::Yaml => serde_yaml::from_str(strip_fence(&body, "yaml"))
                .map_err(|e| AgentError::ParseFailure(format!("invalid yaml action: {e}")))?,
        };

        if action.name.trim().is_empty() {
            return Err(AgentError::ParseFailure("action name is empty".to_string()));
        }

        Ok(AgentThought { thought, action })
    }

    /// 生成规范的带标签文本
    pub fn render(&self, thought: &str, action: &Action) -> Result<String, AgentError> {
        let body = match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(action)
                .map_err(|e| AgentError::ParseFailure(e.to_string()))?,
            OutputFormat::Yaml => serde_yaml::to_string(action)
                .map_err(|e| AgentError::ParseFailure(e.to_string()))?,
        };
        let mut out = String::new();
        if !thought.is_empty() {
            out.push_str(&format!("<{MONOLOGUE_TAG}>\n{thought}\n</{MONOLOGUE_TAG}>\n\n"));
        }
        out.push_str(&format!("<{ACTION_TAG}>\n{}\n</{ACTION_TAG}>", body.trim_end()));
        Ok(out)
    }

    pub fn format_instructions(&self) -> String {
        format!(
            "Every response MUST contain an optional <{m}> block with your private reasoning \
             (never shown to the user), followed by EXACTLY ONE <{a}> block. The <{a}> body is a \
             {fmt} object with the fields `name` (one of the available actions), `description` \
             (why you chose it), `params` (the action's parameters), `request_heartbeat` (true if \
             you need to continue working after seeing the result) and, when requesting a \
             heartbeat, `reason_for_heartbeat`.",
            m = MONOLOGUE_TAG,
            a = ACTION_TAG,
            fmt = self.format.name().to_uppercase()
        )
    }

    pub fn format_rules(&self) -> Vec<String> {
        let mut rules = vec![
            format!("Emit exactly one <{ACTION_TAG}> block per response."),
            "Only use action names listed in available_actions.".to_string(),
            "Use send_message to reply to the user; this ends your turn.".to_string(),
            "Set request_heartbeat to true whenever you need to see an action's result before answering."
                .to_string(),
            "Do not repeat an action with identical params; use the previous result instead.".to_string(),
        ];
        match self.format {
            OutputFormat::Json => {
                rules.push("The action body must be valid JSON with double-quoted keys and strings.".to_string())
            }
            OutputFormat::Yaml => rules.push(
                "The action body must be valid YAML; use a block scalar (|) for multi-line strings.".to_string(),
            ),
        }
        rules
    }

    /// prompt 中的示例（title + 规范渲染文本）
    pub fn output_examples(&self) -> Vec<Value> {
        let mut search = Map::new();
        search.insert("query".into(), Value::String("favourite colour".into()));
        search.insert("page".into(), Value::from(1));
        let mut reply = Map::new();
        reply.insert(
            "message".into(),
            Value::String("Your favourite colour is **blue**.".into()),
        );

        let examples = [
            (
                "Searching past conversation before answering",
                "The user asked about something we discussed before. I should look it up.",
                Action {
                    description: "Find what the user said about their favourite colour".into(),
                    ..Action::new("conversation_search", search)
                        .with_heartbeat("Need the search result to answer")
                },
            ),
            (
                "Replying to the user",
                "I found the answer in the search results.",
                Action {
                    description: "Answer the user".into(),
                    ..Action::new("send_message", reply)
                },
            ),
        ];

        examples
            .iter()
            .filter_map(|(title, thought, action)| {
                self.render(thought, action)
                    .ok()
                    .map(|content| serde_json::json!({ "title": title, "content": content }))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_parse_json_action_with_monologue() {
        let parser = ResponseParser::new(OutputFormat::Json);
        let out = r#"<inner_monologue>
User wants arithmetic.
</inner_monologue>
<action>
{"name": "send_message", "params": {"message": "4"}}
</action>"#;
        let t = parser.parse(out).unwrap();
        assert_eq!(t.thought, "User wants arithmetic.");
        assert_eq!(t.action.name, "send_message");
        assert_eq!(t.action.params["message"], json!("4"));
        assert!(!t.action.request_heartbeat);
    }

    #[test]
    fn test_parse_strips_json_fence() {
        let parser = ResponseParser::new(OutputFormat::Json);
        let out = "<action>\n```json\n{\"name\": \"list_tasks\"}\n```\n</action>";
        let t = parser.parse(out).unwrap();
        assert_eq!(t.action.name, "list_tasks");
        assert!(t.thought.is_empty());
        assert!(t.action.params.is_empty());
    }

    #[test]
    fn test_parse_yaml_action() {
        let parser = ResponseParser::new(OutputFormat::Yaml);
        let out = "<action>\nname: python_code_runner\nparams:\n  code: print(2+2)\nrequest_heartbeat: true\n</action>";
        let t = parser.parse(out).unwrap();
        assert_eq!(t.action.name, "python_code_runner");
        assert_eq!(t.action.params["code"], json!("print(2+2)"));
        assert!(t.action.request_heartbeat);
    }

    #[test]
    fn test_yaml_null_params_become_empty() {
        let parser = ResponseParser::new(OutputFormat::Yaml);
        let t = parser.parse("<action>\nname: list_tasks\nparams:\n</action>").unwrap();
        assert!(t.action.params.is_empty());
    }

    #[test]
    fn test_missing_or_multiple_actions_fail() {
        let parser = ResponseParser::default();
        assert!(matches!(
            parser.parse("just some text"),
            Err(AgentError::ParseFailure(msg)) if msg == "no action"
        ));
        let two = r#"<action>{"name":"a"}</action><action>{"name":"b"}</action>"#;
        assert!(matches!(
            parser.parse(two),
            Err(AgentError::ParseFailure(msg)) if msg.starts_with("multiple actions")
        ));
    }

    #[test]
    fn test_tag_contents_span_lines_and_repeat() {
        let text = "<inner_monologue>\nfirst\n</inner_monologue> x <inner_monologue>second</inner_monologue>";
        assert_eq!(tag_contents(&MONOLOGUE_RE, text), vec!["first", "second"]);
        assert_eq!(tag_contents(&MONOLOGUE_RE, text), vec!["first", "second"]);
        assert!(tag_contents(&ACTION_RE, text).is_empty());
    }

    #[test]
    fn test_empty_name_and_bad_body_fail() {
        let parser = ResponseParser::default();
        assert!(parser.parse(r#"<action>{"name": ""}</action>"#).is_err());
        assert!(parser.parse("<action>{not json}</action>").is_err());
    }

    #[test]
    fn test_format_is_not_sniffed() {
        let parser = ResponseParser::new(OutputFormat::Json);
        assert!(parser.parse("<action>\nname: send_message\n</action>").is_err());
    }

    #[test]
    fn test_unknown_tool_name_still_parses() {
        let parser = ResponseParser::default();
        let t = parser.parse(r#"<action>{"name": "fake_tool"}</action>"#).unwrap();
        assert_eq!(t.action.name, "fake_tool");
    }

    #[test]
    fn test_render_then_parse_round_trip() {
        let action = Action::new(
            "memory_append",
            params(json!({"memory_type": "persona", "text": "line one\nline two", "n": 3})),
        )
        .with_heartbeat("confirm write");
        for format in [OutputFormat::Json, OutputFormat::Yaml] {
            let parser = ResponseParser::new(format);
            let text = parser.render("Saving a note.", &action).unwrap();
            let parsed = parser.parse(&text).unwrap();
            assert_eq!(parsed.thought, "Saving a note.");
            assert_eq!(parsed.action, action);
        }
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = ToolCallFingerprint::of("conversation_search", &params(json!({"query": "x", "page": 1})));
        let mut reordered = Map::new();
        reordered.insert("page".into(), json!(1));
        reordered.insert("query".into(), json!("x"));
        let b = ToolCallFingerprint::of("conversation_search", &reordered);
        assert_eq!(a, b);
        assert_eq!(a.params_hash.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_any_value() {
        let a = ToolCallFingerprint::of("conversation_search", &params(json!({"query": "x", "page": 1})));
        let b = ToolCallFingerprint::of("conversation_search", &params(json!({"query": "x", "page": 2})));
        let c = ToolCallFingerprint::of("memory_read", &params(json!({"query": "x", "page": 1})));
        assert_ne!(a.params_hash, b.params_hash);
        assert_ne!(a, c);
    }

    #[test]
    fn test_examples_render_for_both_formats() {
        for format in [OutputFormat::Json, OutputFormat::Yaml] {
            let parser = ResponseParser::new(format);
            let examples = parser.output_examples();
            assert_eq!(examples.len(), 2);
            for ex in examples {
                let content = ex["content"].as_str().unwrap();
                assert!(parser.parse(content).is_ok());
            }
        }
    }
}
