use std::path::Path;

use anyhow::{Context, Result};
use batchpool_domain::Task;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 读取JSON任务文件，内容是任务对象数组
pub async fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取任务文件失败: {}", path.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&content)
        .with_context(|| format!("解析任务文件失败: {}", path.display()))?;
    info!("从 {} 读取了 {} 个任务", path.display(), tasks.len());
    Ok(tasks)
}

/// 按批次把任务送入分派循环，送完后关闭通道
pub async fn feed(tasks: Vec<Task>, batch_size: usize, ready: mpsc::Sender<Vec<Task>>) {
    let batch_size = batch_size.max(1);
    let mut tasks = tasks.into_iter().peekable();
    while tasks.peek().is_some() {
        let batch: Vec<Task> = tasks.by_ref().take(batch_size).collect();
        debug!("送入 {} 个就绪任务", batch.len());
        if ready.send(batch).await.is_err() {
            debug!("分派循环已停止，不再送入任务");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_load_tasks() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"[
                {{"id": "a", "resource_profile_tag": "small", "payload": "echo a"}},
                {{"id": "b", "resource_profile_tag": "big",
                  "payload": {{"command": "python", "args": ["b.py"]}}}}
            ]"#
        )
        .unwrap();

        let tasks = load_tasks(file.path()).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "a");
        assert_eq!(tasks[1].resource_profile_tag, "big");
    }

    #[tokio::test]
    async fn test_load_tasks_rejects_invalid_file() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, "{{not json").unwrap();
        assert!(load_tasks(file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_feed_in_batches() {
        let tasks: Vec<Task> = (0..5)
            .map(|i| Task::new(format!("t{i}"), "small", serde_json::json!("true")))
            .collect();
        let (tx, mut rx) = mpsc::channel(8);
        feed(tasks, 2, tx).await;

        let mut sizes = Vec::new();
        while let Some(batch) = rx.recv().await {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
