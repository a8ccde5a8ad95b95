//! Local identity store: a JSON file of enrolled identities.
//!
//! Writes go to a sibling temp file which is then renamed over the store,
//! so readers never see a half-written file.

use crate::directory::{DirectoryError, IdentitySource};
use async_trait::async_trait;
use porter_core::EnrolledIdentity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt identity store: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("{}: unsupported store version {found} (expected {})", path.display(), STORE_VERSION)]
    UnsupportedVersion { path: PathBuf, found: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    identities: Vec<EnrolledIdentity>,
}

pub struct LocalStore {
    path: PathBuf,
    /// Serialises read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored identities in insertion order. A missing file is empty.
    pub async fn identities(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        Ok(self.read().await?.identities)
    }

    /// Insert or replace by ID; a replaced identity keeps its position.
    /// Returns true when an existing identity was replaced.
    pub async fn enroll(&self, identity: EnrolledIdentity) -> Result<bool, StoreError> {
        if identity.id.trim().is_empty() {
            return Err(StoreError::InvalidIdentity("empty id".into()));
        }
        if identity.display_name.trim().is_empty() {
            return Err(StoreError::InvalidIdentity("empty display name".into()));
        }

        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        let replaced = match file.identities.iter_mut().find(|i| i.id == identity.id) {
            Some(existing) => {
                *existing = identity;
                true
            }
            None => {
                file.identities.push(identity);
                false
            }
        };
        self.write(&file).await?;
        Ok(replaced)
    }

    /// Remove by ID. Returns false if no such identity was stored.
    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        let before = file.identities.len();
        file.identities.retain(|i| i.id != id);
        if file.identities.len() == before {
            return Ok(false);
        }
        self.write(&file).await?;
        Ok(true)
    }

    async fn read(&self) -> Result<StoreFile, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let file: StoreFile = serde_json::from_slice(&bytes)?;
                if file.version != STORE_VERSION {
                    return Err(StoreError::UnsupportedVersion {
                        path: self.path.clone(),
                        found: file.version,
                    });
                }
                Ok(file)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile {
                version: STORE_VERSION,
                identities: Vec::new(),
            }),
            Err(source) => Err(self.io_error(source)),
        }
    }

    async fn write(&self, file: &StoreFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }

        let body = serde_json::to_vec_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        tracing::debug!(
            path = %self.path.display(),
            identities = file.identities.len(),
            "identity store written"
        );
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl IdentitySource for LocalStore {
    async fn list(&self) -> Result<Vec<EnrolledIdentity>, DirectoryError> {
        Ok(self.identities().await?)
    }

    async fn reference_photo(&self, identity: &EnrolledIdentity) -> Result<Vec<u8>, DirectoryError> {
        let path = identity
            .reference_photo
            .as_deref()
            .ok_or_else(|| DirectoryError::NoPhoto(identity.id.clone()))?;
        tokio::fs::read(path)
            .await
            .map_err(|source| DirectoryError::Photo {
                path: path.to_string(),
                source,
            })
    }
}
