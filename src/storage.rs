//! Durable key-value persistence.
//!
//! Each session owns a scope; within it the engine writes the `session` blob
//! on every mutation and `replay-{sessionId}` on export. The file-backed
//! store keeps one JSON document per key; the in-memory store backs tests.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::fs;

/// Key under which the serialized session lives inside its scope.
pub const SESSION_KEY: &str = "session";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, scope: &str, key: &str, value: &Value) -> Result<()>;
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>>;
    async fn delete_scope(&self, scope: &str) -> Result<()>;
    /// All scopes that currently hold at least one key.
    async fn scopes(&self) -> Result<Vec<String>>;
}

/// One JSON file per key under `root/<scope>/<key>.json`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scope_dir(&self, scope: &str) -> Result<PathBuf> {
        validate_component(scope)?;
        Ok(self.root.join(scope))
    }

    fn key_path(&self, scope: &str, key: &str) -> Result<PathBuf> {
        validate_component(key)?;
        Ok(self.scope_dir(scope)?.join(format!("{key}.json")))
    }
}

fn validate_component(raw: &str) -> Result<()> {
    let ok = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    anyhow::ensure!(ok, "invalid storage path component: {raw:?}");
    Ok(())
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn put(&self, scope: &str, key: &str, value: &Value) -> Result<()> {
        let dir = self.scope_dir(scope)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating scope dir {}", dir.display()))?;
        let path = self.key_path(scope, key)?;
        let bytes = serde_json::to_vec(value).context("serializing value")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        let path = self.key_path(scope, key)?;
        match fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn delete_scope(&self, scope: &str) -> Result<()> {
        let dir = self.scope_dir(scope)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", dir.display())),
        }
    }

    async fn scopes(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", self.root.display()))
            }
        };
        while let Some(entry) = entries.next_entry().await.context("iterating store root")? {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    found.push(name.to_string());
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Test-facing store with no durability.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put(&self, scope: &str, key: &str, value: &Value) -> Result<()> {
        self.entries
            .insert((scope.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .entries
            .get(&(scope.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn delete_scope(&self, scope: &str) -> Result<()> {
        self.entries.retain(|(s, _), _| s != scope);
        Ok(())
    }

    async fn scopes(&self) -> Result<Vec<String>> {
        let mut found: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        found.sort();
        found.dedup();
        Ok(found)
    }
}
