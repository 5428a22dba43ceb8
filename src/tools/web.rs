//! download_webpage_by_url：抓取网页并转为可读文本写入临时文件
//!
//! GET 请求带超时与 User-Agent；HTML 响应经 html2text 提取文本，超过 max_chars 时截断。
//! 文本写入临时目录，路径返回给模型并记录到 TurnState.filepaths，
//! 之后可用 send_message 的 filepath 参数直接回复。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::core::{ActionResult, TurnState};
use crate::tools::schema::params_schema;
use crate::tools::{parse_args, Tool, ToolError};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DownloadParams {
    /// http(s) URL of the page
    pub url: String,
}

pub struct DownloadWebpageTool {
    client: Client,
    max_chars: usize,
    temp_dir: PathBuf,
}

/// 内容是否像 HTML
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    let head: String = s.chars().take(512).collect::<String>().to_lowercase();
    head.starts_with("<!") || head.starts_with("<html") || head.contains("<head") || head.contains("<body")
}

fn validate_url(url: &str) -> Result<&str, ToolError> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| ToolError::InvalidParameters(format!("not an http(s) URL: {url}")))?;
    if rest.split('/').next().unwrap_or("").is_empty() {
        return Err(ToolError::InvalidParameters(format!("URL has no host: {url}")));
    }
    Ok(url)
}

/// 按字符截断并追加标记
fn truncate_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n...[truncated]");
    out
}

impl DownloadWebpageTool {
    pub fn new(timeout_secs: u64, max_chars: usize, temp_dir: Option<PathBuf>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_chars,
            temp_dir: temp_dir.unwrap_or_else(std::env::temp_dir),
        }
    }

    fn to_text(&self, body: String) -> String {
        let body = body.strip_prefix('\u{FEFF}').map(str::to_string).unwrap_or(body);
        if !looks_like_html(&body) {
            return body;
        }
        match from_read(body.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => body,
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, ToolError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("Request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ToolError::Failed(format!("HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::Failed(format!("Read body: {e}")))?;
        Ok(truncate_chars(self.to_text(body), self.max_chars))
    }

    async fn save(&self, text: &str) -> Result<PathBuf, ToolError> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| ToolError::Failed(format!("temp dir: {e}")))?;
        let path = self.temp_dir.join(format!("memloop-page-{}.txt", Uuid::new_v4()));
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| ToolError::Failed(format!("write {}: {e}", path.display())))?;
        Ok(path)
    }
}

#[async_trait]
impl Tool for DownloadWebpageTool {
    fn name(&self) -> &str {
        "download_webpage_by_url"
    }

    fn description(&self) -> &str {
        "Download a web page, convert it to plain text and save it to a temporary file. Returns the file path."
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<DownloadParams>()
    }

    async fn execute(&self, state: &mut TurnState, thought: &str, args: Value) -> Result<ActionResult, ToolError> {
        let params: DownloadParams = parse_args(args)?;
        let url = validate_url(&params.url)?;
        tracing::info!(url = %url, "download_webpage_by_url");

        let text = self.fetch(url).await?;
        let path = self.save(&text).await?;
        let path = path.to_string_lossy().to_string();
        state.filepaths.push(path.clone());
        Ok(ActionResult::success(
            thought,
            self.name(),
            format!("Saved {} characters from {url} to {path}", text.chars().count()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TurnRequest, User};
    use crate::memory::{ConversationMemory, RecallWindow, WorkingMemory};
    use crate::react::event_bus;
    use serde_json::json;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://docs.rs/tokio").is_ok());
        assert!(validate_url(" http://example.com ").is_ok());
        assert!(matches!(validate_url("ftp://x"), Err(ToolError::InvalidParameters(_))));
        assert!(matches!(validate_url("https:///path"), Err(ToolError::InvalidParameters(_))));
    }

    #[test]
    fn test_truncate_chars_marks_cut() {
        assert_eq!(truncate_chars("abc".into(), 5), "abc");
        assert_eq!(truncate_chars("abcdef".into(), 3), "abc\n...[truncated]");
    }

    #[test]
    fn test_html_is_converted() {
        let tool = DownloadWebpageTool::new(5, 100, None);
        let text = tool.to_text("<html><body><h1>Title</h1><p>Body text</p></body></html>".into());
        assert!(text.contains("Title"));
        assert!(text.contains("Body text"));
        assert!(!text.contains("<p>"));
        assert_eq!(tool.to_text("plain".into()), "plain");
    }

    #[tokio::test]
    async fn test_save_writes_into_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let tool = DownloadWebpageTool::new(5, 100, Some(dir.path().to_path_buf()));
        let path = tool.save("hello").await.unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_bad_url_leaves_filepaths_untouched() {
        let (outbox, _stream) = event_bus();
        let mut s = TurnState::new(
            TurnRequest::new(Uuid::new_v4(), User::new("u"), "q"),
            outbox,
            WorkingMemory::new(10),
            RecallWindow::new(1000, 0.8),
            ConversationMemory::new(20, 4000),
        );
        let r = DownloadWebpageTool::new(5, 100, None)
            .execute(&mut s, "t", json!({"url": "not a url"}))
            .await;
        assert!(matches!(r, Err(ToolError::InvalidParameters(_))));
        assert!(s.filepaths.is_empty());
    }
}
