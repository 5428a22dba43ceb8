//! Memory Store：记忆块与归档消息的存储与相似度检索
//!
//! MemoryStore 是外部存储的窄接口；InMemoryStore 为进程内实现（RwLock，后写覆盖先写），
//! 检索按余弦相似度排序，未带向量的条目排在最后并保持创建顺序。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::memory::{MemoryBlock, MemoryType, Message, PaginatedResult};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store unavailable: {0}")]
    Backend(String),
    #[error("memory block {0} not found")]
    MissingBlock(Uuid),
}

/// 归档的会话消息（用于 conversation_search）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub conversation_id: Uuid,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn insert_block(&self, block: MemoryBlock) -> Result<(), MemoryError>;

    /// 按 id 覆盖写入
    async fn update_block(&self, block: &MemoryBlock) -> Result<(), MemoryError>;

    async fn remove_block(&self, owner: Uuid, id: Uuid) -> Result<bool, MemoryError>;

    /// 删除 (owner, type) 下的全部块，返回删除数量
    async fn delete_blocks(&self, owner: Uuid, memory_type: MemoryType) -> Result<usize, MemoryError>;

    /// (owner, type) 下的块，按创建顺序
    async fn blocks(&self, owner: Uuid, memory_type: MemoryType) -> Result<Vec<MemoryBlock>, MemoryError>;

    async fn all_blocks(&self, owner: Uuid) -> Result<Vec<MemoryBlock>, MemoryError>;

    /// 按与 query 的相似度排序后分页
    async fn search_blocks(
        &self,
        owner: Uuid,
        memory_type: MemoryType,
        query: Option<&[f32]>,
        page: usize,
        page_size: usize,
    ) -> Result<PaginatedResult<MemoryBlock>, MemoryError>;

    async fn append_messages(&self, owner: Uuid, messages: Vec<ArchivedMessage>) -> Result<(), MemoryError>;

    async fn search_messages(
        &self,
        owner: Uuid,
        query: Option<&[f32]>,
        page: usize,
        page_size: usize,
    ) -> Result<PaginatedResult<ArchivedMessage>, MemoryError>;
}

/// 余弦相似度；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// 按相似度降序排列；稳定排序保证同分时保持原有（创建）顺序
fn rank_by_similarity<T>(items: Vec<T>, query: Option<&[f32]>, embedding: impl Fn(&T) -> Option<&Vec<f32>>) -> Vec<T> {
    let Some(query) = query else {
        return items;
    };
    let mut scored: Vec<(f32, T)> = items
        .into_iter()
        .map(|item| {
            let score = embedding(&item)
                .map(|e| cosine_similarity(e, query))
                .unwrap_or(f32::MIN);
            (score, item)
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, item)| item).collect()
}

/// 进程内 Memory Store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    blocks: RwLock<HashMap<(Uuid, MemoryType), Vec<MemoryBlock>>>,
    messages: RwLock<HashMap<Uuid, Vec<ArchivedMessage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn insert_block(&self, block: MemoryBlock) -> Result<(), MemoryError> {
        let mut blocks = self.blocks.write().await;
        blocks
            .entry((block.owner, block.memory_type))
            .or_default()
            .push(block);
        Ok(())
    }

    async fn update_block(&self, block: &MemoryBlock) -> Result<(), MemoryError> {
        let mut blocks = self.blocks.write().await;
        let slot = blocks
            .get_mut(&(block.owner, block.memory_type))
            .and_then(|list| list.iter_mut().find(|b| b.id == block.id))
            .ok_or(MemoryError::MissingBlock(block.id))?;
        *slot = block.clone();
        Ok(())
    }

    async fn remove_block(&self, owner: Uuid, id: Uuid) -> Result<bool, MemoryError> {
        let mut blocks = self.blocks.write().await;
        for ((o, _), list) in blocks.iter_mut() {
            if *o != owner {
                continue;
            }
            if let Some(pos) = list.iter().position(|b| b.id == id) {
                list.remove(pos);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_blocks(&self, owner: Uuid, memory_type: MemoryType) -> Result<usize, MemoryError> {
        let mut blocks = self.blocks.write().await;
        Ok(blocks.remove(&(owner, memory_type)).map(|l| l.len()).unwrap_or(0))
    }

    async fn blocks(&self, owner: Uuid, memory_type: MemoryType) -> Result<Vec<MemoryBlock>, MemoryError> {
        let blocks = self.blocks.read().await;
        Ok(blocks.get(&(owner, memory_type)).cloned().unwrap_or_default())
    }

    async fn all_blocks(&self, owner: Uuid) -> Result<Vec<MemoryBlock>, MemoryError> {
        let blocks = self.blocks.read().await;
        let mut all: Vec<MemoryBlock> = blocks
            .iter()
            .filter(|((o, _), _)| *o == owner)
            .flat_map(|(_, list)| list.iter().cloned())
            .collect();
        all.sort_by_key(|b| b.created_at);
        Ok(all)
    }

    async fn search_blocks(
        &self,
        owner: Uuid,
        memory_type: MemoryType,
        query: Option<&[f32]>,
        page: usize,
        page_size: usize,
    ) -> Result<PaginatedResult<MemoryBlock>, MemoryError> {
        let items = self.blocks(owner, memory_type).await?;
        let ranked = rank_by_similarity(items, query, |b| b.embedding.as_ref());
        Ok(PaginatedResult::paginate(ranked, page, page_size))
    }

    async fn append_messages(&self, owner: Uuid, messages: Vec<ArchivedMessage>) -> Result<(), MemoryError> {
        let mut store = self.messages.write().await;
        store.entry(owner).or_default().extend(messages);
        Ok(())
    }

    async fn search_messages(
        &self,
        owner: Uuid,
        query: Option<&[f32]>,
        page: usize,
        page_size: usize,
    ) -> Result<PaginatedResult<ArchivedMessage>, MemoryError> {
        let items = {
            let store = self.messages.read().await;
            store.get(&owner).cloned().unwrap_or_default()
        };
        let ranked = rank_by_similarity(items, query, |m| m.embedding.as_ref());
        Ok(PaginatedResult::paginate(ranked, page, page_size))
    }
}
