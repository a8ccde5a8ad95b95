//! Identity sources feeding the gallery.

use async_trait::async_trait;
use porter_core::EnrolledIdentity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("directory returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("identity store: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("cannot read photo {path}: {source}")]
    Photo {
        path: String,
        source: std::io::Error,
    },
    #[error("identity {0} has no reference photo")]
    NoPhoto(String),
}

#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Every identity known to the source, in a stable order.
    async fn list(&self) -> Result<Vec<EnrolledIdentity>, DirectoryError>;

    /// Encoded bytes of the identity's reference photo.
    async fn reference_photo(&self, identity: &EnrolledIdentity) -> Result<Vec<u8>, DirectoryError>;
}
