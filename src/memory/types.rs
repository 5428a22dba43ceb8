//! 记忆块与分页结果
//!
//! MemoryType 决定每类记忆在上下文中的 token 配额；MemoryBlock 为存储单元；
//! PaginatedResult 统一了记忆分页与会话检索的分页元数据。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 记忆类型（按上下文长度的比例分配 token 配额）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Persona,
    UserProfile,
    Recall,
    Summary,
    Archival,
    System,
}

impl MemoryType {
    pub const ALL: [MemoryType; 6] = [
        MemoryType::Persona,
        MemoryType::UserProfile,
        MemoryType::Recall,
        MemoryType::Summary,
        MemoryType::Archival,
        MemoryType::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Persona => "persona",
            MemoryType::UserProfile => "user_profile",
            MemoryType::Recall => "recall",
            MemoryType::Summary => "summary",
            MemoryType::Archival => "archival",
            MemoryType::System => "system",
        }
    }

    /// 占上下文长度的比例
    pub fn share(&self) -> f64 {
        match self {
            MemoryType::Persona => 0.05,
            MemoryType::UserProfile => 0.05,
            MemoryType::Recall => 0.20,
            MemoryType::Summary => 0.05,
            MemoryType::Archival => 0.01,
            MemoryType::System => 0.30,
        }
    }

    pub fn token_limit(&self, context_length: usize) -> usize {
        (context_length as f64 * self.share()) as usize
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        MemoryType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| {
                let valid: Vec<&str> = MemoryType::ALL.iter().map(|t| t.as_str()).collect();
                format!("Invalid memory type '{}'. Valid types: {}", s, valid.join(", "))
            })
    }
}

/// 记忆块：唯一块模型下每 (user, type) 至多一个；分页模型下每个块即一页
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub id: Uuid,
    pub owner: Uuid,
    pub memory_type: MemoryType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl MemoryBlock {
    pub fn new(owner: Uuid, memory_type: MemoryType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            memory_type,
            content: content.into(),
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// 渲染为 prompt 片段：带头部，超出配额时只保留末尾部分
    pub fn serialize_for_prompt(&self, token_limit: usize, chars_per_token: usize) -> String {
        let max_chars = token_limit.saturating_mul(chars_per_token.max(1));
        let total = self.content.chars().count();
        let body: String = if total > max_chars {
            self.content.chars().skip(total - max_chars).collect()
        } else {
            self.content.clone()
        };
        format!(
            "[Memory Block: {} | id={} | max_tokens={}]\n{}",
            self.memory_type, self.id, token_limit, body
        )
    }
}

/// 分页结果（页码从 1 开始；越界页返回空结果）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub results: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total_count: usize,
    pub page_size: usize,
}

pub fn total_pages(total_count: usize, page_size: usize) -> usize {
    total_count.div_ceil(page_size.max(1))
}

impl<T> PaginatedResult<T> {
    /// 从已排序的完整列表中切出第 `page` 页
    pub fn paginate(items: Vec<T>, page: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let total_count = items.len();
        let total_pages = total_pages(total_count, page_size);
        let results = if page == 0 || page > total_pages {
            Vec::new()
        } else {
            items
                .into_iter()
                .skip((page - 1) * page_size)
                .take(page_size)
                .collect()
        };
        Self {
            results,
            page,
            total_pages,
            total_count,
            page_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
