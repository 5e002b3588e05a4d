//! Filesystem-backed JSON blob store
//!
//! Keys are slash-separated paths ("results/ds_1/ES/gym_goers/run_42");
//! each maps to one pretty-printed `.json` file under the store root.

use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_json(&self, key: &str, value: &serde_json::Value) -> LabResult<()>;
    async fn get_json(&self, key: &str) -> LabResult<Option<serde_json::Value>>;
    async fn delete(&self, key: &str) -> LabResult<()>;
}

/// Serialize-then-put convenience for any blob store.
pub async fn put_typed<T: Serialize + Sync>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> LabResult<()> {
    store.put_json(key, &serde_json::to_value(value)?).await
}

/// Get-then-deserialize convenience for any blob store.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn BlobStore,
    key: &str,
) -> LabResult<Option<T>> {
    match store.get_json(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> LabResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Map a key to a file path, rejecting anything that could escape the
    /// store root.
    fn path_for(&self, key: &str) -> LabResult<PathBuf> {
        if key.is_empty() {
            return Err(LabError::Storage("blob key is empty".to_string()));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(LabError::Storage(format!("invalid blob key: {}", key)));
            }
            let clean: String = segment
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            path.push(clean);
        }
        path.set_extension("json");
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_json(&self, key: &str, value: &serde_json::Value) -> LabResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, body).await?;
        log::debug!("blob written: {}", path.display());
        Ok(())
    }

    async fn get_json(&self, key: &str) -> LabResult<Option<serde_json::Value>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> LabResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
