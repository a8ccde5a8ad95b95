//! Gallery matching and distance-to-confidence mapping.

use crate::types::{Descriptor, Gallery};
use serde::{Deserialize, Serialize};

/// What the face matcher saw in one probe frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaceMatch {
    /// No face, or the best detection scored below the minimum confidence.
    NoFace { detection_confidence: f32 },
    /// A face was found but no gallery entry is within the match threshold.
    Unknown { distance: f32 },
    /// Closest gallery identity within the match threshold.
    Match { identity_id: String, distance: f32 },
}

impl FaceMatch {
    /// Presentation confidence in [0, 1]; 0 when no face was found.
    pub fn confidence(&self) -> f32 {
        match self {
            FaceMatch::NoFace { .. } => 0.0,
            FaceMatch::Unknown { distance } | FaceMatch::Match { distance, .. } => {
                confidence_from_distance(*distance)
            }
        }
    }
}

/// Map a cosine distance to a confidence: `clamp(1 - distance, 0, 1)`.
///
/// Strictly decreasing in distance over [0, 1]; distances of 1 or more
/// (orthogonal or opposed descriptors) all map to 0.
pub fn confidence_from_distance(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Nearest gallery identity to `probe` by cosine distance.
///
/// Always visits every descriptor of every identity so timing does not
/// depend on where the match sits. Ties keep the earlier gallery entry.
pub fn nearest_match(probe: &Descriptor, gallery: &Gallery, threshold: f32) -> FaceMatch {
    let mut best_distance = f32::INFINITY;
    let mut best_idx: Option<usize> = None;

    for (i, identity) in gallery.identities().iter().enumerate() {
        for descriptor in &identity.descriptors {
            let distance = probe.distance(descriptor);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }
    }

    match best_idx {
        Some(idx) if best_distance <= threshold => FaceMatch::Match {
            identity_id: gallery.identities()[idx].id.clone(),
            distance: best_distance,
        },
        Some(_) => FaceMatch::Unknown {
            distance: best_distance,
        },
        // Empty gallery: nothing to be close to.
        None => FaceMatch::Unknown { distance: 1.0 },
    }
}
