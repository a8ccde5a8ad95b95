//! Enrollment into the local identity store from a photo file.

use crate::gallery::{DescriptorExtractor, ExtractError, GalleryCache};
use crate::store::{LocalStore, StoreError};
use porter_core::EnrolledIdentity;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("cannot read photo {}: {source}", path.display())]
    Photo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0}")]
    Extract(#[from] ExtractError),
    #[error("no face found in {}", .0.display())]
    NoFace(PathBuf),
    #[error("{0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub id: String,
    pub display_name: String,
    pub unit: Option<String>,
    pub photo_path: PathBuf,
}

pub struct Enrollment {
    store: Arc<LocalStore>,
    extractor: Arc<dyn DescriptorExtractor>,
    cache: Arc<GalleryCache>,
}

impl Enrollment {
    pub fn new(
        store: Arc<LocalStore>,
        extractor: Arc<dyn DescriptorExtractor>,
        cache: Arc<GalleryCache>,
    ) -> Self {
        Self {
            store,
            extractor,
            cache,
        }
    }

    /// Extract a descriptor from the photo and upsert the identity.
    /// Returns true when an existing identity was replaced.
    pub async fn enroll(&self, request: EnrollRequest) -> Result<bool, EnrollmentError> {
        let photo = read_photo(&request.photo_path).await?;
        let descriptor = self
            .extractor
            .extract(&photo)
            .await?
            .ok_or_else(|| EnrollmentError::NoFace(request.photo_path.clone()))?;

        let identity = EnrolledIdentity {
            id: request.id,
            display_name: request.display_name,
            unit: request.unit.filter(|u| !u.trim().is_empty()),
            authorized: true,
            descriptors: vec![descriptor],
            reference_photo: Some(request.photo_path.to_string_lossy().into_owned()),
        };
        let id = identity.id.clone();

        let replaced = self.store.enroll(identity).await?;
        self.cache.invalidate().await;

        tracing::info!(id = %id, replaced, "identity enrolled");
        Ok(replaced)
    }

    /// Remove an identity from the local store.
    pub async fn remove(&self, id: &str) -> Result<bool, EnrollmentError> {
        let removed = self.store.remove(id).await?;
        if removed {
            self.cache.invalidate().await;
            tracing::info!(id, "identity removed");
        }
        Ok(removed)
    }
}

async fn read_photo(path: &Path) -> Result<Vec<u8>, EnrollmentError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| EnrollmentError::Photo {
            path: path.to_path_buf(),
            source,
        })
}
