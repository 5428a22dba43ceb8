//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MEMLOOP__*` 覆盖（双下划线表示嵌套，如 `MEMLOOP__LLM__PROVIDER=openai`）。
//! 所有字段都有默认值，缺省配置即可离线运行（mock 模型 + 哈希嵌入）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::react::OutputFormat;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub memory: MemorySection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、数据目录、系统提示词
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 对话持久化目录，未设置时用 ./data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: default_data_dir(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_system_prompt() -> String {
    "You are a helpful assistant with a persistent, paginated memory. Think privately, use the \
     available actions to look things up or remember them, and reply to the user with send_message."
        .to_string()
}

/// [llm] 段：后端选择、模型与限流重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：mock / openai
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// 限流后重试前的等待（毫秒）
    #[serde(default = "default_throttle_retry_delay_ms")]
    pub throttle_retry_delay_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            embedding_model: default_embedding_model(),
            throttle_retry_delay_ms: default_throttle_retry_delay_ms(),
        }
    }
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_throttle_retry_delay_ms() -> u64 {
    10_000
}

/// [agent] 段：输出格式、重试与轮次上限、各类分页大小
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub output_format: OutputFormat,
    /// 连续解析失败达到此次数后走兜底回复
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: usize,
    /// 超过此轮数后在 prompt 中要求模型尽快收尾
    #[serde(default = "default_warn_after_epochs")]
    pub warn_after_epochs: usize,
    /// 模型调用硬上限
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_observations_page_size")]
    pub observations_page_size: usize,
    #[serde(default = "default_conversation_page_size")]
    pub conversation_page_size: usize,
    /// Error 路径中附带的最近消息条数
    #[serde(default = "default_error_path_history")]
    pub error_path_history: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::default(),
            retry_ceiling: default_retry_ceiling(),
            warn_after_epochs: default_warn_after_epochs(),
            max_epochs: default_max_epochs(),
            observations_page_size: default_observations_page_size(),
            conversation_page_size: default_conversation_page_size(),
            error_path_history: default_error_path_history(),
        }
    }
}

fn default_retry_ceiling() -> usize {
    2
}

fn default_warn_after_epochs() -> usize {
    20
}

fn default_max_epochs() -> usize {
    25
}

fn default_observations_page_size() -> usize {
    10
}

fn default_conversation_page_size() -> usize {
    20
}

fn default_error_path_history() -> usize {
    5
}

/// 记忆纪律：分页块（默认）或每类唯一块
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryDiscipline {
    #[default]
    Paginated,
    Unique,
}

/// [memory] 段：上下文长度、页预算与溢出阈值
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default)]
    pub discipline: MemoryDiscipline,
    /// 上下文长度（token），各记忆类型按比例分配
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default = "default_average_chars_per_token")]
    pub average_chars_per_token: usize,
    /// 分页模型下每页的 token 上限
    #[serde(default = "default_page_token_budget")]
    pub page_token_budget: usize,
    #[serde(default = "default_overflow_threshold")]
    pub overflow_threshold: f64,
    #[serde(default = "default_search_page_size")]
    pub search_page_size: usize,
    /// 对话历史窗口的 token 预算
    #[serde(default = "default_conversation_history_tokens")]
    pub conversation_history_tokens: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            discipline: MemoryDiscipline::default(),
            context_length: default_context_length(),
            average_chars_per_token: default_average_chars_per_token(),
            page_token_budget: default_page_token_budget(),
            overflow_threshold: default_overflow_threshold(),
            search_page_size: default_search_page_size(),
            conversation_history_tokens: default_conversation_history_tokens(),
        }
    }
}

fn default_context_length() -> usize {
    8000
}

fn default_average_chars_per_token() -> usize {
    4
}

fn default_page_token_budget() -> usize {
    100
}

fn default_overflow_threshold() -> f64 {
    0.8
}

fn default_search_page_size() -> usize {
    10
}

fn default_conversation_history_tokens() -> usize {
    1600
}

/// [tools] 段：工具超时、Python 解释器、网页抓取
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_python_interpreter")]
    pub python_interpreter: String,
    /// python_code_runner 子进程自身的超时（秒）
    #[serde(default = "default_code_timeout_secs")]
    pub code_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_fetch_chars")]
    pub max_fetch_chars: usize,
    /// 临时文件目录，未设置时用系统临时目录
    pub temp_dir: Option<PathBuf>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            python_interpreter: default_python_interpreter(),
            code_timeout_secs: default_code_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_fetch_chars: default_max_fetch_chars(),
            temp_dir: None,
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_python_interpreter() -> String {
    "python3".to_string()
}

fn default_code_timeout_secs() -> u64 {
    20
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_max_fetch_chars() -> usize {
    20_000
}

/// 从 config 目录加载配置，环境变量 MEMLOOP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MEMLOOP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MEMLOOP")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
