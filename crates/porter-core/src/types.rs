use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face descriptor (512-dimensional for ArcFace, L2-normalised).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes all dimensions; a zero vector has similarity 0.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 - similarity`, in [0, 2]. Lower = more similar.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        1.0 - self.similarity(other)
    }
}

fn default_authorized() -> bool {
    true
}

/// A person enrolled for recognition.
///
/// `authorized = false` keeps the person recognisable but outside the
/// access roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub id: String,
    pub display_name: String,
    /// House or unit the person belongs to.
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_authorized")]
    pub authorized: bool,
    #[serde(default)]
    pub descriptors: Vec<Descriptor>,
    /// Where the reference photo lives (file path or URL, source-dependent).
    #[serde(default)]
    pub reference_photo: Option<String>,
}

/// Identity fields copied into an audit entry at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub id: String,
    pub display_name: String,
    pub unit: Option<String>,
}

impl From<&EnrolledIdentity> for IdentitySnapshot {
    fn from(identity: &EnrolledIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            unit: identity.unit.clone(),
        }
    }
}

/// Immutable set of enrolled identities loaded for one matching window.
///
/// Replaced as a whole on refresh; never edited in place.
#[derive(Debug, Clone)]
pub struct Gallery {
    identities: Vec<EnrolledIdentity>,
    pub loaded_at: DateTime<Utc>,
}

impl Gallery {
    pub fn new(identities: Vec<EnrolledIdentity>) -> Self {
        Self {
            identities,
            loaded_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn identities(&self) -> &[EnrolledIdentity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total descriptors across all identities.
    pub fn descriptor_count(&self) -> usize {
        self.identities.iter().map(|i| i.descriptors.len()).sum()
    }

    /// Number of identities in the access roster.
    pub fn roster_len(&self) -> usize {
        self.identities.iter().filter(|i| i.authorized).count()
    }

    /// Look up any enrolled identity by ID.
    pub fn identity(&self, id: &str) -> Option<&EnrolledIdentity> {
        self.identities.iter().find(|i| i.id == id)
    }
}
