//! 流式事件：Turn 执行过程中的有序进度片段
//!
//! Outbox 为可克隆的发送端，从不阻塞；接收端消失后发送静默丢弃。结束标记（stage = end）
//! 由共享标志保证最多发送一次，之后的发送一律丢弃，因此结束标记始终是最后一个片段。

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 片段所属阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Planning,
    Reasoning,
    Draft,
    Final,
    Error,
    End,
}

/// 单个流式片段（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_title: Option<String>,
}

impl StreamChunk {
    pub fn new(stage: Stage, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            stage,
            stage_title: None,
        }
    }

    pub fn titled(stage: Stage, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            stage,
            stage_title: Some(title.into()),
        }
    }

    pub fn end() -> Self {
        Self::new(Stage::End, "")
    }

    pub fn is_end(&self) -> bool {
        self.stage == Stage::End
    }

    /// SSE 帧：`data: <json>\n\n`
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", json)
    }
}

/// 创建一对发送端 / 接收端
pub fn event_bus() -> (Outbox, ChunkStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Outbox {
            tx,
            finished: Arc::new(AtomicBool::new(false)),
        },
        ChunkStream { rx, done: false },
    )
}

/// 发送端
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<StreamChunk>,
    finished: Arc<AtomicBool>,
}

impl Outbox {
    /// 发送一个片段；已结束或接收端已关闭时返回 false
    pub fn emit(&self, chunk: StreamChunk) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(chunk).is_ok()
    }

    pub fn stage(&self, stage: Stage, content: impl Into<String>) -> bool {
        self.emit(StreamChunk::new(stage, content))
    }

    pub fn titled(&self, stage: Stage, title: impl Into<String>, content: impl Into<String>) -> bool {
        self.emit(StreamChunk::titled(stage, title, content))
    }

    /// 发送结束标记；只有第一次调用生效
    pub fn finish(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(StreamChunk::end());
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// 接收端是否已被丢弃（消费方断开）
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// 析构时发送结束标记（panic / 提前返回时同样生效）
    pub fn finish_guard(&self) -> FinishGuard {
        FinishGuard(self.clone())
    }
}

pub struct FinishGuard(Outbox);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// 接收端：按发送顺序产出片段，收到结束标记后返回 None
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<StreamChunk>,
    done: bool,
}

impl ChunkStream {
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        if self.done {
            return None;
        }
        let chunk = self.rx.recv().await;
        match &chunk {
            Some(c) if c.is_end() => self.done = true,
            None => self.done = true,
            _ => {}
        }
        chunk
    }

    /// 读取到结束（包含结束标记）
    pub async fn collect_all(mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(c) = self.next_chunk().await {
            out.push(c);
        }
        out
    }
}

impl Stream for ChunkStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_end() {
                    self.done = true;
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
