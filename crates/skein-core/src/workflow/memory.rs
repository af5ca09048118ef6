//! Shared memory store for `MEMORY` refs and memory-enabled steps.
//!
//! A step that touches memory holds the store's lock from the moment it reads
//! the memory until it has appended its output, so concurrent steps see each
//! other's writes in some serial order.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    content: String,
    file: Option<PathBuf>,
    /// Backing file does not end with a newline yet
    file_open_line: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

/// Exclusive access to the memory for the duration of one step.
pub struct MemoryGuard<'a> {
    state: MutexGuard<'a, MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back the store with `path`, loading what is already there.
    pub async fn open(path: &Path) -> Result<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(EngineError::Io(format!(
                    "Failed to read memory file '{}': {}",
                    path.display(),
                    e
                )))
            }
        };
        tracing::debug!("[Memory] Opened {} ({} chars)", path.display(), content.len());
        let file_open_line = !content.is_empty() && !content.ends_with('\n');
        Ok(Self {
            state: Mutex::new(MemoryState {
                content,
                file: Some(path.to_path_buf()),
                file_open_line,
            }),
        })
    }

    pub async fn lock(&self) -> MemoryGuard<'_> {
        MemoryGuard {
            state: self.state.lock().await,
        }
    }

    /// Put `context` ahead of what the store already holds.
    ///
    /// The context is visible to steps but never written to the backing file.
    pub async fn seed(&self, context: &str) {
        let context = context.trim_end();
        if context.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        state.content = if state.content.is_empty() {
            context.to_string()
        } else {
            format!("{}\n{}", context, state.content)
        };
    }

    pub async fn snapshot(&self) -> String {
        self.state.lock().await.content.clone()
    }
}

impl MemoryGuard<'_> {
    pub fn content(&self) -> &str {
        &self.state.content
    }

    /// Append one entry, persisting it when the store has a backing file.
    pub async fn append(&mut self, entry: &str) -> Result<()> {
        let entry = entry.trim_end();
        if entry.is_empty() {
            return Ok(());
        }
        let line = format!("{}\n", entry);

        if let Some(path) = self.state.file.clone() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            if self.state.file_open_line {
                file.write_all(b"\n").await?;
            }
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            self.state.file_open_line = false;
        }
        if !self.state.content.is_empty() && !self.state.content.ends_with('\n') {
            self.state.content.push('\n');
        }
        self.state.content.push_str(&line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_append_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem").join("memory.md");

        let store = MemoryStore::open(&path).await.unwrap();
        {
            let mut guard = store.lock().await;
            guard.append("first fact").await.unwrap();
            guard.append("second fact\n\n").await.unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first fact\nsecond fact\n");

        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.snapshot().await, "first fact\nsecond fact\n");
    }

    #[tokio::test]
    async fn test_seed_context() {
        let store = MemoryStore::new();
        store.seed("seed").await;
        store.lock().await.append("more").await.unwrap();
        assert_eq!(store.snapshot().await, "seed\nmore\n");
    }

    #[tokio::test]
    async fn test_read_call_write_is_serialized() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = store.lock().await;
                let seen = guard.content().lines().count();
                tokio::time::sleep(Duration::from_millis(5)).await;
                guard.append(&format!("entry {} saw {}", i, seen)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snapshot = store.snapshot().await;
        let mut seen: Vec<usize> = snapshot
            .lines()
            .map(|l| l.rsplit(' ').next().unwrap().parse().unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
