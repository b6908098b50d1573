//! # Transaction Message Store
//!
//! Keeps transaction-related calls that have not reached a terminal outcome,
//! so the ordered session record survives a process restart.

use crate::error::{ChargePointError, ChargePointResult};
use anyhow::Context;
use ocpp_types::Call;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// A transaction-related call together with its delivery progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub call: Call,
    pub attempts: u32,
}

/// Storage backend for unresolved transaction-related calls
#[async_trait::async_trait]
pub trait TransactionMessageStore: Send + Sync {
    /// Insert a message, or update it if its unique id is already stored
    async fn insert(&self, message: StoredMessage) -> ChargePointResult<()>;

    /// Forget a message. Unknown ids are ignored.
    async fn remove(&self, unique_id: &str) -> ChargePointResult<()>;

    /// All stored messages in insertion order
    async fn load_all(&self) -> ChargePointResult<Vec<StoredMessage>>;
}

fn upsert(messages: &mut Vec<StoredMessage>, message: StoredMessage) {
    match messages
        .iter_mut()
        .find(|m| m.call.unique_id == message.call.unique_id)
    {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}

/// Store that lives as long as the process
#[derive(Default)]
pub struct InMemoryStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TransactionMessageStore for InMemoryStore {
    async fn insert(&self, message: StoredMessage) -> ChargePointResult<()> {
        upsert(&mut *self.messages.lock().await, message);
        Ok(())
    }

    async fn remove(&self, unique_id: &str) -> ChargePointResult<()> {
        self.messages
            .lock()
            .await
            .retain(|m| m.call.unique_id != unique_id);
        Ok(())
    }

    async fn load_all(&self) -> ChargePointResult<Vec<StoredMessage>> {
        Ok(self.messages.lock().await.clone())
    }
}

/// Store backed by a single JSON file, rewritten on every change
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read(&self) -> anyhow::Result<Vec<StoredMessage>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("decoding {}", self.path.display()))
    }

    async fn write(&self, messages: &[StoredMessage]) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(messages).context("encoding messages")?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))
    }

    async fn modify<F>(&self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Vec<StoredMessage>) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut messages = self.read().await?;
        f(&mut messages);
        self.write(&messages).await
    }
}

fn to_persistence_error(err: anyhow::Error) -> ChargePointError {
    ChargePointError::persistence(format!("{:#}", err))
}

#[async_trait::async_trait]
impl TransactionMessageStore for JsonFileStore {
    async fn insert(&self, message: StoredMessage) -> ChargePointResult<()> {
        self.modify(move |messages| upsert(messages, message))
            .await
            .map_err(to_persistence_error)
    }

    async fn remove(&self, unique_id: &str) -> ChargePointResult<()> {
        let unique_id = unique_id.to_string();
        self.modify(move |messages| messages.retain(|m| m.call.unique_id != unique_id))
            .await
            .map_err(to_persistence_error)
    }

    async fn load_all(&self) -> ChargePointResult<Vec<StoredMessage>> {
        let _guard = self.lock.lock().await;
        self.read().await.map_err(to_persistence_error)
    }
}
