//! Recognition outcomes and the bounded audit log.

use crate::policy::{Decision, OperatingMode, Reason, Verdict};
use crate::types::IdentitySnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Default number of entries retained locally.
pub const DEFAULT_AUDIT_CAPACITY: usize = 50;

/// Result of one completed recognition cycle. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionOutcome {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub mode: OperatingMode,
    pub matched_identity_id: Option<String>,
    /// Presentation confidence in [0, 1].
    pub confidence: f32,
    pub decision: Decision,
    pub reason: Reason,
    pub message: String,
}

impl RecognitionOutcome {
    pub fn new(mode: OperatingMode, verdict: &Verdict) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            mode,
            matched_identity_id: verdict.matched_identity_id.clone(),
            confidence: verdict.confidence.clamp(0.0, 1.0),
            decision: verdict.decision,
            reason: verdict.reason,
            message: verdict.message.clone(),
        }
    }
}

/// An outcome plus the identity fields as they were when it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    #[serde(flatten)]
    pub outcome: RecognitionOutcome,
    pub identity: Option<IdentitySnapshot>,
}

impl AuditLogEntry {
    pub fn from_verdict(mode: OperatingMode, verdict: &Verdict) -> Self {
        Self {
            outcome: RecognitionOutcome::new(mode, verdict),
            identity: verdict.identity.clone(),
        }
    }
}

/// Newest-first ring buffer of audit entries.
///
/// Appending past capacity evicts the oldest entry.
#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditLogEntry>,
    capacity: usize,
}

impl AuditLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, entry: AuditLogEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Up to `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditLogEntry> {
        self.entries.iter().take(n).cloned().collect()
    }

    pub fn latest(&self) -> Option<&AuditLogEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}
