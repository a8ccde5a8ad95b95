//! Access decisions.
//!
//! One policy serves both operating modes. A face is let through only when
//! it matched, the confidence reaches the threshold, and the identity is
//! in the roster; every other case falls to the mode's refusal
//! (`Denied` at an access point, `Intruder` under surveillance).

use crate::matcher::FaceMatch;
use crate::types::{Gallery, IdentitySnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Door/gate control: unknown faces are denied.
    Access,
    /// Perimeter watch: unknown faces are intruders.
    Surveillance,
}

impl OperatingMode {
    /// Decision for anything that is not a positive, in-roster match.
    pub fn refusal(self) -> Decision {
        match self {
            OperatingMode::Access => Decision::Denied,
            OperatingMode::Surveillance => Decision::Intruder,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Access => "access",
            OperatingMode::Surveillance => "surveillance",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "access" => Ok(OperatingMode::Access),
            "surveillance" => Ok(OperatingMode::Surveillance),
            other => Err(format!("unknown operating mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Authorized,
    Denied,
    Intruder,
    Error,
}

impl Decision {
    pub fn is_authorized(self) -> bool {
        self == Decision::Authorized
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Authorized => "authorized",
            Decision::Denied => "denied",
            Decision::Intruder => "intruder",
            Decision::Error => "error",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Recognized,
    NoFace,
    Unrecognized,
    LowConfidence,
    NotInRoster,
    CapabilityFailure,
}

/// Policy output for one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: Reason,
    pub confidence: f32,
    pub matched_identity_id: Option<String>,
    pub identity: Option<IdentitySnapshot>,
    pub message: String,
}

impl Verdict {
    /// Verdict for a cycle whose capture or match step failed.
    pub fn from_failure(detail: impl fmt::Display) -> Self {
        Self {
            decision: Decision::Error,
            reason: Reason::CapabilityFailure,
            confidence: 0.0,
            matched_identity_id: None,
            identity: None,
            message: format!("Recognition failed: {detail}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionPolicy {
    pub mode: OperatingMode,
    /// Minimum confidence for a match to count.
    pub threshold: f32,
}

impl DecisionPolicy {
    pub fn new(mode: OperatingMode, threshold: f32) -> Self {
        Self { mode, threshold }
    }

    /// Decide on a matcher result, resolving the identity against `gallery`.
    pub fn decide(&self, face: &FaceMatch, gallery: &Gallery) -> Verdict {
        let confidence = face.confidence();

        let (reason, matched_identity_id, identity) = match face {
            FaceMatch::NoFace { .. } => (Reason::NoFace, None, None),
            FaceMatch::Unknown { .. } => (Reason::Unrecognized, None, None),
            FaceMatch::Match { identity_id, .. } => {
                let identity = gallery.identity(identity_id);
                let reason = if confidence < self.threshold {
                    Reason::LowConfidence
                } else {
                    match identity {
                        Some(i) if i.authorized => Reason::Recognized,
                        _ => Reason::NotInRoster,
                    }
                };
                (
                    reason,
                    Some(identity_id.clone()),
                    identity.map(IdentitySnapshot::from),
                )
            }
        };

        let decision = if reason == Reason::Recognized {
            Decision::Authorized
        } else {
            self.mode.refusal()
        };

        let message = self.message(reason, confidence, identity.as_ref());

        Verdict {
            decision,
            reason,
            confidence,
            matched_identity_id,
            identity,
            message,
        }
    }

    fn message(&self, reason: Reason, confidence: f32, identity: Option<&IdentitySnapshot>) -> String {
        let name = identity.map(|i| i.display_name.as_str()).unwrap_or("unknown");
        match (self.mode, reason) {
            (OperatingMode::Access, Reason::Recognized) => format!("Access granted to {name}"),
            (OperatingMode::Surveillance, Reason::Recognized) => format!("Authorized resident: {name}"),
            (OperatingMode::Access, Reason::NoFace) => "No face detected".to_string(),
            (OperatingMode::Surveillance, Reason::NoFace) => {
                "Intruder detected: no identifiable face".to_string()
            }
            (OperatingMode::Access, Reason::Unrecognized) => "Face not recognized".to_string(),
            (OperatingMode::Surveillance, Reason::Unrecognized) => {
                "Intruder detected: face not recognized".to_string()
            }
            (_, Reason::LowConfidence) => format!(
                "Face detected but confidence too low ({:.1}%)",
                confidence * 100.0
            ),
            (OperatingMode::Access, Reason::NotInRoster) => {
                "Recognized face is not in the current roster".to_string()
            }
            (OperatingMode::Surveillance, Reason::NotInRoster) => {
                "Intruder detected: person not authorized".to_string()
            }
            (_, Reason::CapabilityFailure) => "Recognition failed".to_string(),
        }
    }
}
