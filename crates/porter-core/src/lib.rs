//! porter-core: face analysis, gallery matching and access decisions.
//!
//! Uses SCRFD for face detection and ArcFace for descriptors, both running
//! via ONNX Runtime for CPU inference. Matching, the decision policy and
//! the audit log are pure and independent of the inference backend.

pub mod alignment;
pub mod audit;
pub mod detector;
pub mod matcher;
pub mod policy;
pub mod recognizer;
pub mod types;

pub use audit::{AuditLog, AuditLogEntry, RecognitionOutcome};
pub use detector::{DetectorError, FaceDetector};
pub use matcher::{confidence_from_distance, nearest_match, FaceMatch};
pub use policy::{Decision, DecisionPolicy, OperatingMode, Reason, Verdict};
pub use recognizer::{FaceRecognizer, RecognizerError};
pub use types::{BoundingBox, Descriptor, EnrolledIdentity, Gallery, IdentitySnapshot};

use std::path::PathBuf;

/// Default directory holding `det_10g.onnx` and `w600k_r50.onnx`.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/porter/models")
}
