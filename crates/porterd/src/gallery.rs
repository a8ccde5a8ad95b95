//! Gallery cache: loads enrolled identities and their descriptors from an
//! identity source and shares the result until it goes stale.

use crate::directory::{DirectoryError, IdentitySource};
use crate::engine::{Analysis, EngineError, EngineHandle};
use async_trait::async_trait;
use porter_core::{Descriptor, EnrolledIdentity, Gallery};
use porter_hw::frame::decode_image;
use porter_hw::FrameError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("identity source failed: {0}")]
    Directory(#[from] DirectoryError),
    /// A refresh this caller queued behind failed.
    #[error("gallery refresh failed: {0}")]
    RefreshFailed(String),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("cannot decode photo: {0}")]
    Decode(#[from] FrameError),
    #[error("face analysis failed: {0}")]
    Engine(#[from] EngineError),
}

/// Turns a reference photo into a descriptor.
#[async_trait]
pub trait DescriptorExtractor: Send + Sync {
    /// `Ok(None)` when the photo holds no usable face.
    async fn extract(&self, photo: &[u8]) -> Result<Option<Descriptor>, ExtractError>;
}

/// Extractor running photos through the ONNX engine.
pub struct EngineExtractor {
    engine: EngineHandle,
    min_detection_confidence: f32,
}

impl EngineExtractor {
    pub fn new(engine: EngineHandle, min_detection_confidence: f32) -> Self {
        Self {
            engine,
            min_detection_confidence,
        }
    }
}

#[async_trait]
impl DescriptorExtractor for EngineExtractor {
    async fn extract(&self, photo: &[u8]) -> Result<Option<Descriptor>, ExtractError> {
        let frame = decode_image(photo)?;
        match self.engine.analyze(frame, self.min_detection_confidence).await? {
            Analysis::Face(face) => Ok(Some(face.descriptor)),
            Analysis::NoFace { .. } => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GalleryStats {
    pub identities: usize,
    pub descriptors: usize,
    pub roster: usize,
    /// Seconds since the last successful refresh.
    pub age_secs: Option<u64>,
    pub fresh: bool,
    pub refreshes: u64,
}

struct CacheState {
    current: Option<Arc<Gallery>>,
    refreshed_at: Option<Instant>,
    /// Error of the most recent fetch, cleared by the next success.
    last_failure: Option<String>,
}

pub struct GalleryCache {
    source: Arc<dyn IdentitySource>,
    extractor: Arc<dyn DescriptorExtractor>,
    ttl: Duration,
    state: Mutex<CacheState>,
    /// Bumped after every successful refresh.
    generation: AtomicU64,
    /// Bumped after every fetch, successful or not.
    attempts: AtomicU64,
}

impl GalleryCache {
    pub fn new(
        source: Arc<dyn IdentitySource>,
        extractor: Arc<dyn DescriptorExtractor>,
        ttl: Duration,
    ) -> Self {
        Self {
            source,
            extractor,
            ttl,
            state: Mutex::new(CacheState {
                current: None,
                refreshed_at: None,
                last_failure: None,
            }),
            generation: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    /// Current gallery, refreshing it when stale or when `force` is set.
    ///
    /// Callers that queued behind a fetch share its result instead of
    /// fetching again: its snapshot on success, its error on failure unless
    /// an unforced caller still holds a fresh snapshot. On failure the
    /// previous snapshot is kept and the cache stays as fresh (or stale) as
    /// it was. Every refresh re-derives descriptors from reference photos.
    pub async fn load(&self, force: bool) -> Result<Arc<Gallery>, GalleryError> {
        let seen = self.attempts.load(Ordering::Acquire);
        let mut state = self.state.lock().await;
        let joined = self.attempts.load(Ordering::Acquire) != seen;

        if joined && state.last_failure.is_none() {
            if let (Some(gallery), Some(_)) = (&state.current, state.refreshed_at) {
                return Ok(gallery.clone());
            }
        }

        if !force {
            if let (Some(gallery), Some(at)) = (&state.current, state.refreshed_at) {
                if at.elapsed() < self.ttl {
                    return Ok(gallery.clone());
                }
            }
        }

        if joined {
            if let Some(reason) = &state.last_failure {
                return Err(GalleryError::RefreshFailed(reason.clone()));
            }
        }

        let started = Instant::now();
        let fetched = self.fetch().await;
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let gallery = match fetched {
            Ok(gallery) => Arc::new(gallery),
            Err(e) => {
                state.last_failure = Some(e.to_string());
                return Err(e);
            }
        };

        state.current = Some(gallery.clone());
        state.refreshed_at = Some(Instant::now());
        state.last_failure = None;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::info!(
            identities = gallery.len(),
            descriptors = gallery.descriptor_count(),
            roster = gallery.roster_len(),
            generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            force,
            "gallery refreshed"
        );
        Ok(gallery)
    }

    /// Mark the current snapshot stale; the next `load` fetches.
    pub async fn invalidate(&self) {
        self.state.lock().await.refreshed_at = None;
        tracing::debug!("gallery invalidated");
    }

    pub async fn stats(&self) -> GalleryStats {
        let state = self.state.lock().await;
        let age = state.refreshed_at.map(|at| at.elapsed());
        let gallery = state.current.as_deref();
        GalleryStats {
            identities: gallery.map_or(0, Gallery::len),
            descriptors: gallery.map_or(0, Gallery::descriptor_count),
            roster: gallery.map_or(0, Gallery::roster_len),
            age_secs: age.map(|a| a.as_secs()),
            fresh: age.is_some_and(|a| a < self.ttl),
            refreshes: self.generation.load(Ordering::Acquire),
        }
    }

    async fn fetch(&self) -> Result<Gallery, GalleryError> {
        let records = self.source.list().await?;
        let mut identities = Vec::with_capacity(records.len());

        for mut identity in records {
            if !identity.descriptors.is_empty() {
                identities.push(identity);
                continue;
            }

            if identity.reference_photo.is_none() {
                tracing::warn!(id = %identity.id, "identity has neither descriptors nor photo; skipped");
                continue;
            }

            let Some(descriptor) = self.describe(&identity).await else {
                continue;
            };
            identity.descriptors.push(descriptor);
            identities.push(identity);
        }

        Ok(Gallery::new(identities))
    }

    /// Fetch and analyse one reference photo, logging why it was unusable.
    async fn describe(&self, identity: &EnrolledIdentity) -> Option<Descriptor> {
        let photo = match self.source.reference_photo(identity).await {
            Ok(photo) => photo,
            Err(e) => {
                tracing::warn!(id = %identity.id, error = %e, "reference photo unavailable; skipped");
                return None;
            }
        };

        match self.extractor.extract(&photo).await {
            Ok(Some(descriptor)) => Some(descriptor),
            Ok(None) => {
                tracing::warn!(id = %identity.id, "no face in reference photo; skipped");
                None
            }
            Err(e) => {
                tracing::warn!(id = %identity.id, error = %e, "reference photo analysis failed; skipped");
                None
            }
        }
    }
}
