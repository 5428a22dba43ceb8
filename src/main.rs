//! memloop - 命令行入口
//!
//! 初始化日志、按配置构建运行时，然后逐行读取标准输入，每行作为一次 Turn 运行并打印流式片段。
//! 用法：`memloop [config.toml]`；输入 `/quit` 退出，`/new` 开始新会话。

use std::path::PathBuf;

use anyhow::Context;
use memloop::{observability, AgentRuntime, Stage, User};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let runtime = AgentRuntime::from_config(config_path).context("Failed to build agent runtime")?;

    let user = User::new(std::env::var("USER").unwrap_or_else(|_| "user".to_string()));
    let mut conversation_id = Uuid::new_v4();
    tracing::info!(conversation = %conversation_id, "memloop ready");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                conversation_id = Uuid::new_v4();
                println!("(new conversation {conversation_id})");
                continue;
            }
            _ => {}
        }

        let mut handle = runtime.spawn_turn(conversation_id, user.clone(), line);
        while let Some(chunk) = handle.next_chunk().await {
            match chunk.stage {
                Stage::Final => stdout.write_all(chunk.content.as_bytes()).await?,
                Stage::Error => stdout.write_all(format!("[error] {}\n", chunk.content).as_bytes()).await?,
                Stage::End => stdout.write_all(b"\n").await?,
                _ => tracing::debug!(stage = ?chunk.stage, content = %chunk.content, "progress"),
            }
            stdout.flush().await?;
        }
        if let Err(e) = handle.join().await {
            tracing::warn!(error = %e, "turn ended with error");
        }
    }

    Ok(())
}
