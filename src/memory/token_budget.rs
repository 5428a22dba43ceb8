//! Token 预算与溢出控制
//!
//! 每类记忆按 `token_limit × chars_per_token` 换算出字符容量。使用率达到阈值（默认 80%）时
//! 在 prompt 中加入告警；一次写入会让使用率超过 100% 时，先按 FIFO 淘汰最旧条目，
//! 直到包含新条目在内的使用率不高于 50%。

use std::collections::VecDeque;

const TRUNCATION_MARKER: &str = "...\n[truncated due to token budget]";

/// Token 估算器（固定的平均字符数 / token）
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: usize,
}

impl TokenEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn estimate(&self, text: &str) -> usize {
        text.chars().count() / self.chars_per_token
    }

    /// token 配额换算为字符容量
    pub fn capacity_chars(&self, token_limit: usize) -> usize {
        token_limit.saturating_mul(self.chars_per_token)
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

/// 某段上下文的使用情况（字符）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetUsage {
    pub used_chars: usize,
    pub capacity_chars: usize,
}

impl BudgetUsage {
    pub fn ratio(&self) -> f64 {
        if self.capacity_chars == 0 {
            return if self.used_chars == 0 { 0.0 } else { f64::INFINITY };
        }
        self.used_chars as f64 / self.capacity_chars as f64
    }

    /// 使用率 ≥ threshold 时返回告警文本
    pub fn alert(&self, label: &str, threshold: f64) -> Option<String> {
        let ratio = self.ratio();
        if ratio < threshold {
            return None;
        }
        Some(format!(
            "{} memory is at {:.0}% of its capacity ({} of {} chars). \
             Consolidate or evict entries you no longer need.",
            label,
            ratio * 100.0,
            self.used_chars,
            self.capacity_chars
        ))
    }
}

/// 可按字符计量、可截断的条目
pub trait Measured {
    fn char_len(&self) -> usize;
    fn truncate_chars(&mut self, max_chars: usize);
}

impl Measured for String {
    fn char_len(&self) -> usize {
        self.chars().count()
    }

    fn truncate_chars(&mut self, max_chars: usize) {
        *self = truncate_text(self, max_chars);
    }
}

/// 截断到 max_chars 字符以内（保留开头，附截断标记）
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }
    let head: String = text.chars().take(max_chars - marker_len).collect();
    format!("{}{}", head, TRUNCATION_MARKER)
}

/// 有字符容量上限的 FIFO 窗口
#[derive(Debug, Clone)]
pub struct BoundedWindow<T> {
    entries: VecDeque<T>,
    capacity_chars: usize,
    alert_threshold: f64,
}

impl<T: Measured> BoundedWindow<T> {
    pub fn new(capacity_chars: usize, alert_threshold: f64) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity_chars,
            alert_threshold,
        }
    }

    pub fn used_chars(&self) -> usize {
        self.entries.iter().map(Measured::char_len).sum()
    }

    pub fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            used_chars: self.used_chars(),
            capacity_chars: self.capacity_chars,
        }
    }

    pub fn alert(&self, label: &str) -> Option<String> {
        self.usage().alert(label, self.alert_threshold)
    }

    /// 写入一条；溢出时先淘汰最旧条目，返回被淘汰的条目
    pub fn push(&mut self, mut entry: T) -> Vec<T> {
        let half = self.capacity_chars / 2;
        if entry.char_len() > half {
            entry.truncate_chars(half);
        }
        let incoming = entry.char_len();
        let mut evicted = Vec::new();
        if self.used_chars() + incoming > self.capacity_chars {
            while self.used_chars() + incoming > half {
                match self.entries.pop_front() {
                    Some(old) => evicted.push(old),
                    None => break,
                }
            }
            tracing::debug!(
                evicted = evicted.len(),
                capacity = self.capacity_chars,
                "memory window overflow, evicted oldest entries"
            );
        }
        self.entries.push_back(entry);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// 最近的 n 条（时间顺序）
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &T> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn capacity_chars(&self) -> usize {
        self.capacity_chars
    }
}
