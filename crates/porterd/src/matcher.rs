//! Face matcher capability: frame + gallery in, match result out.

use crate::engine::{Analysis, EngineError, EngineHandle};
use async_trait::async_trait;
use porter_core::{nearest_match, FaceMatch, Gallery};
use porter_hw::Frame;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("face analysis failed: {0}")]
    Engine(#[from] EngineError),
    #[error("matcher unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait FaceMatcher: Send + Sync {
    /// Find the closest gallery identity to the most prominent face in `frame`.
    async fn match_face(&self, frame: Frame, gallery: Arc<Gallery>)
        -> Result<FaceMatch, MatchError>;
}

/// Matcher backed by the ONNX engine thread.
pub struct EngineMatcher {
    engine: EngineHandle,
    min_detection_confidence: f32,
    match_threshold: f32,
}

impl EngineMatcher {
    pub fn new(engine: EngineHandle, min_detection_confidence: f32, match_threshold: f32) -> Self {
        Self {
            engine,
            min_detection_confidence,
            match_threshold,
        }
    }
}

#[async_trait]
impl FaceMatcher for EngineMatcher {
    async fn match_face(
        &self,
        frame: Frame,
        gallery: Arc<Gallery>,
    ) -> Result<FaceMatch, MatchError> {
        let face = match self.engine.analyze(frame, self.min_detection_confidence).await? {
            Analysis::NoFace {
                detection_confidence,
            } => return Ok(FaceMatch::NoFace { detection_confidence }),
            Analysis::Face(face) => face,
        };

        let result = nearest_match(&face.descriptor, &gallery, self.match_threshold);
        tracing::debug!(
            detection_confidence = face.detection_confidence,
            identities = gallery.len(),
            result = ?result,
            "probe compared against gallery"
        );
        Ok(result)
    }
}
