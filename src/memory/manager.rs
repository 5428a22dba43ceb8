//! Memory Manager：唯一块与分页块两种记忆纪律
//!
//! 唯一块：每 (user, type) 至多一个块，支持 upsert / replace / read / append / delete。
//! 分页块：每 (user, type) 可有多页，按创建顺序编号；追加时当前页放不下就开新页，
//! 读取时按与查询的余弦相似度排序后分页。每次写入都会重新计算嵌入。

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::MemorySection;
use crate::core::AgentError;
use crate::llm::EmbeddingProvider;
use crate::memory::store::{ArchivedMessage, MemoryError, MemoryStore};
use crate::memory::token_budget::TokenEstimator;
use crate::memory::{MemoryBlock, MemoryType, Message, PaginatedResult};

/// page_evict 的结果：页仍有内容，或已被清空并移除
#[derive(Debug, Clone, PartialEq)]
pub enum PageEviction {
    Kept(MemoryBlock),
    Removed(Uuid),
}

impl From<MemoryError> for AgentError {
    fn from(e: MemoryError) -> Self {
        AgentError::FatalInfrastructure(e.to_string())
    }
}

pub struct MemoryManager {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: MemorySection,
    estimator: TokenEstimator,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn MemoryStore>, embedder: Arc<dyn EmbeddingProvider>, settings: MemorySection) -> Self {
        let estimator = TokenEstimator::new(settings.average_chars_per_token);
        Self {
            store,
            embedder,
            settings,
            estimator,
        }
    }

    pub fn settings(&self) -> &MemorySection {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn token_count(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    pub fn token_limit(&self, memory_type: MemoryType) -> usize {
        memory_type.token_limit(self.settings.context_length)
    }

    /// 某类记忆的字符容量
    pub fn capacity_chars(&self, memory_type: MemoryType) -> usize {
        self.estimator.capacity_chars(self.token_limit(memory_type))
    }

    /// 嵌入失败时不阻断写入：记录告警，块将在相似度排序中排在最后
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(text).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, storing without vector");
                None
            }
        }
    }

    async fn refresh(&self, mut block: MemoryBlock) -> Result<MemoryBlock, AgentError> {
        block.embedding = self.embed(&block.content).await;
        self.store.update_block(&block).await?;
        Ok(block)
    }

    async fn create(&self, user: Uuid, memory_type: MemoryType, content: &str) -> Result<MemoryBlock, AgentError> {
        let mut block = MemoryBlock::new(user, memory_type, content);
        block.embedding = self.embed(content).await;
        self.store.insert_block(block.clone()).await?;
        Ok(block)
    }

    // ---- 唯一块 ----

    pub async fn read(&self, user: Uuid, memory_type: MemoryType) -> Result<Option<MemoryBlock>, AgentError> {
        Ok(self.store.blocks(user, memory_type).await?.into_iter().next())
    }

    pub async fn upsert(&self, user: Uuid, memory_type: MemoryType, content: &str) -> Result<MemoryBlock, AgentError> {
        match self.read(user, memory_type).await? {
            Some(mut block) => {
                block.content = content.to_string();
                self.refresh(block).await
            }
            None => self.create(user, memory_type, content).await,
        }
    }

    /// 精确子串替换；块不存在或子串不存在时返回 NotFound
    pub async fn replace(
        &self,
        user: Uuid,
        memory_type: MemoryType,
        old: &str,
        new: &str,
    ) -> Result<MemoryBlock, AgentError> {
        if old.is_empty() {
            return Err(AgentError::InvalidParameters {
                tool: "memory".to_string(),
                reason: "text to replace must not be empty".to_string(),
            });
        }
        let mut block = self
            .read(user, memory_type)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("no {memory_type} memory block")))?;
        if !block.content.contains(old) {
            return Err(AgentError::NotFound(format!(
                "'{old}' does not occur in the {memory_type} memory block"
            )));
        }
        block.content = block.content.replace(old, new);
        self.refresh(block).await
    }

    /// 追加文本；块不存在时创建
    pub async fn append(
        &self,
        user: Uuid,
        memory_type: MemoryType,
        text: &str,
        separator: &str,
    ) -> Result<MemoryBlock, AgentError> {
        match self.read(user, memory_type).await? {
            Some(mut block) => {
                if !block.content.is_empty() {
                    block.content.push_str(separator);
                }
                block.content.push_str(text);
                self.refresh(block).await
            }
            None => self.create(user, memory_type, text).await,
        }
    }

    pub async fn delete(&self, user: Uuid, memory_type: MemoryType) -> Result<bool, AgentError> {
        Ok(self.store.delete_blocks(user, memory_type).await? > 0)
    }

    /// 用户的全部记忆块，每类取最新创建的一个（唯一块模型下即该类唯一的块）
    pub async fn all_blocks(&self, user: Uuid) -> Result<BTreeMap<MemoryType, MemoryBlock>, AgentError> {
        let mut out = BTreeMap::new();
        for block in self.store.all_blocks(user).await? {
            out.insert(block.memory_type, block);
        }
        Ok(out)
    }

    // ---- 分页块 ----

    /// 追加到最后一页；放不下（超过页预算）时开新页。返回写入的那一页
    pub async fn page_append(
        &self,
        user: Uuid,
        memory_type: MemoryType,
        text: &str,
    ) -> Result<PaginatedResult<MemoryBlock>, AgentError> {
        let pages = self.store.blocks(user, memory_type).await?;
        let budget = self.settings.page_token_budget;
        let incoming = self.token_count(text);

        let (block, page) = match pages.last() {
            Some(last) if self.token_count(&last.content) + incoming <= budget => {
                let mut block = last.clone();
                if !block.content.is_empty() {
                    block.content.push('\n');
                }
                block.content.push_str(text);
                (self.refresh(block).await?, pages.len())
            }
            _ => (self.create(user, memory_type, text).await?, pages.len() + 1),
        };
        tracing::debug!(%memory_type, page, "memory page appended");

        let total = pages.len().max(page);
        Ok(PaginatedResult {
            results: vec![block],
            page,
            total_pages: total,
            total_count: total,
            page_size: 1,
        })
    }

    /// 按与 query 的相似度排序后返回第 page 页（越界返回空结果）
    pub async fn page_read(
        &self,
        user: Uuid,
        memory_type: MemoryType,
        query: &str,
        page: usize,
    ) -> Result<PaginatedResult<MemoryBlock>, AgentError> {
        let query_embedding = if query.trim().is_empty() {
            None
        } else {
            self.embed(query).await
        };
        Ok(self
            .store
            .search_blocks(user, memory_type, query_embedding.as_deref(), page, 1)
            .await?)
    }

    async fn page_at(&self, user: Uuid, memory_type: MemoryType, page: usize) -> Result<MemoryBlock, AgentError> {
        let pages = self.store.blocks(user, memory_type).await?;
        page.checked_sub(1)
            .and_then(|idx| pages.into_iter().nth(idx))
            .ok_or_else(|| AgentError::NotFound(format!("Page {page} of {memory_type} memory does not exist")))
    }

    /// 在创建顺序的第 page 页中替换子串
    pub async fn page_replace(
        &self,
        user: Uuid,
        memory_type: MemoryType,
        page: usize,
        old: &str,
        new: &str,
    ) -> Result<MemoryBlock, AgentError> {
        if old.is_empty() {
            return Err(AgentError::InvalidParameters {
                tool: "memory".to_string(),
                reason: "text to replace must not be empty".to_string(),
            });
        }
        let mut block = self.page_at(user, memory_type, page).await?;
        if !block.content.contains(old) {
            return Err(AgentError::NotFound(format!(
                "'{old}' does not occur on page {page} of {memory_type} memory"
            )));
        }
        block.content = block.content.replace(old, new);
        self.refresh(block).await
    }

    /// 从第 page 页删除文本；页被清空时移除该页
    pub async fn page_evict(
        &self,
        user: Uuid,
        memory_type: MemoryType,
        page: usize,
        text: &str,
    ) -> Result<PageEviction, AgentError> {
        let block = self.page_replace(user, memory_type, page, text, "").await?;
        if block.content.trim().is_empty() {
            self.store.remove_block(user, block.id).await?;
            return Ok(PageEviction::Removed(block.id));
        }
        Ok(PageEviction::Kept(block))
    }

    // ---- 会话归档 ----

    /// 归档一次问答，供 conversation_search 检索
    pub async fn archive_exchange(
        &self,
        user: Uuid,
        conversation_id: Uuid,
        messages: &[Message],
    ) -> Result<(), AgentError> {
        let mut archived = Vec::with_capacity(messages.len());
        for m in messages {
            archived.push(ArchivedMessage {
                conversation_id,
                message: m.clone(),
                embedding: self.embed(&m.content).await,
            });
        }
        self.store.append_messages(user, archived).await?;
        Ok(())
    }

    pub async fn search_conversation(
        &self,
        user: Uuid,
        query: &str,
        page: usize,
    ) -> Result<PaginatedResult<ArchivedMessage>, AgentError> {
        let query_embedding = self.embed(query).await;
        Ok(self
            .store
            .search_messages(user, query_embedding.as_deref(), page, self.settings.search_page_size)
            .await?)
    }
}
