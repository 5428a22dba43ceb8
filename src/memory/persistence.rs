//! 对话持久化
//!
//! TurnPersistence 负责保存每次 Turn 的问答并在下一次 Turn 开始时提供历史。
//! JsonFilePersistence 为每个会话写一个 JSON 文件；InMemoryPersistence 用于测试与嵌入式场景。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::{AgentError, TurnResult};
use crate::memory::Message;

#[async_trait]
pub trait TurnPersistence: Send + Sync {
    /// 会话的历史消息（时间顺序）
    async fn history(&self, user: Uuid, conversation_id: Uuid) -> Result<Vec<Message>, AgentError>;

    async fn persist(&self, result: &TurnResult) -> Result<(), AgentError>;
}

/// 会话文件内容
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConversationFile {
    user_id: Option<Uuid>,
    messages: Vec<Message>,
}

/// 每个会话一个 JSON 文件：`<dir>/<conversation_id>.json`
#[derive(Debug)]
pub struct JsonFilePersistence {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, conversation_id: Uuid) -> PathBuf {
        self.dir.join(format!("{conversation_id}.json"))
    }

    async fn load(&self, conversation_id: Uuid) -> Result<ConversationFile, AgentError> {
        let path = self.path_for(conversation_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                AgentError::FatalInfrastructure(format!("corrupt conversation file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConversationFile::default()),
            Err(e) => Err(AgentError::FatalInfrastructure(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl TurnPersistence for JsonFilePersistence {
    async fn history(&self, user: Uuid, conversation_id: Uuid) -> Result<Vec<Message>, AgentError> {
        let file = self.load(conversation_id).await?;
        match file.user_id {
            Some(owner) if owner != user => Ok(Vec::new()),
            _ => Ok(file.messages),
        }
    }

    async fn persist(&self, result: &TurnResult) -> Result<(), AgentError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(result.conversation_id).await?;
        file.user_id = Some(result.user_id);
        file.messages.push(Message::user(result.user_message.clone()));
        file.messages.push(Message::assistant(result.answer.clone()));

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::FatalInfrastructure(format!("create {}: {e}", self.dir.display())))?;
        let data = serde_json::to_string_pretty(&file)
            .map_err(|e| AgentError::FatalInfrastructure(e.to_string()))?;
        let path = self.path_for(result.conversation_id);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| AgentError::FatalInfrastructure(format!("write {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "conversation persisted");
        Ok(())
    }
}

/// 进程内持久化（记录每次 persist 调用）
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    results: Mutex<Vec<TurnResult>>,
    history: Mutex<HashMap<Uuid, Vec<Message>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置某会话的历史
    pub async fn seed(&self, conversation_id: Uuid, messages: Vec<Message>) {
        self.history.lock().await.insert(conversation_id, messages);
    }

    pub async fn persisted(&self) -> Vec<TurnResult> {
        self.results.lock().await.clone()
    }
}

#[async_trait]
impl TurnPersistence for InMemoryPersistence {
    async fn history(&self, _user: Uuid, conversation_id: Uuid) -> Result<Vec<Message>, AgentError> {
        Ok(self
            .history
            .lock()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist(&self, result: &TurnResult) -> Result<(), AgentError> {
        self.results.lock().await.push(result.clone());
        let mut history = self.history.lock().await;
        let messages = history.entry(result.conversation_id).or_default();
        messages.push(Message::user(result.user_message.clone()));
        messages.push(Message::assistant(result.answer.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Phase;
    use chrono::Utc;

    fn result(conversation_id: Uuid, user_id: Uuid, q: &str, a: &str) -> TurnResult {
        TurnResult {
            conversation_id,
            user_id,
            user_message: q.to_string(),
            answer: a.to_string(),
            phase: Phase::NeedFinal,
            epochs: 1,
            fallback: false,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonFilePersistence::new(dir.path().join("conversations"));
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(p.history(user, conv).await.unwrap().is_empty());
        p.persist(&result(conv, user, "What's 2+2?", "4")).await.unwrap();
        p.persist(&result(conv, user, "And 3+3?", "6")).await.unwrap();

        let history = p.history(user, conv).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["What's 2+2?", "4", "And 3+3?", "6"]);
        assert!(p.history(Uuid::new_v4(), conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let conv = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{conv}.json")), "not json").unwrap();
        let p = JsonFilePersistence::new(dir.path());
        assert!(matches!(
            p.history(Uuid::new_v4(), conv).await,
            Err(AgentError::FatalInfrastructure(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_records_results() {
        let p = InMemoryPersistence::new();
        let conv = Uuid::new_v4();
        p.persist(&result(conv, Uuid::new_v4(), "hi", "hello")).await.unwrap();
        assert_eq!(p.persisted().await.len(), 1);
        assert_eq!(p.history(Uuid::new_v4(), conv).await.unwrap().len(), 2);
    }
}
