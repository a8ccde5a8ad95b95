//! Best-effort forwarding of audit entries to the backend.
//!
//! The local audit log is authoritative. Mirroring happens after the local
//! append and its failures are only logged.

use async_trait::async_trait;
use porter_core::{AuditLogEntry, Decision, OperatingMode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Api { status: u16, body: String },
}

#[async_trait]
pub trait AuditMirror: Send + Sync {
    /// Record an attempt at the access point.
    async fn record_access(&self, entry: &AuditLogEntry) -> Result<(), MirrorError>;

    /// Raise an intrusion alert.
    async fn record_intrusion(&self, entry: &AuditLogEntry) -> Result<(), MirrorError>;
}

/// Where an entry is mirrored, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorTarget {
    AccessLog,
    Intrusion,
}

/// Access mode logs every attempt; surveillance only raises intrusions.
/// Failed cycles are kept local.
pub fn target_for(entry: &AuditLogEntry) -> Option<MirrorTarget> {
    match (entry.outcome.mode, entry.outcome.decision) {
        (_, Decision::Error) => None,
        (OperatingMode::Access, _) => Some(MirrorTarget::AccessLog),
        (OperatingMode::Surveillance, Decision::Intruder) => Some(MirrorTarget::Intrusion),
        (OperatingMode::Surveillance, _) => None,
    }
}

/// Forward one entry, logging instead of returning failures.
pub async fn forward(mirror: &dyn AuditMirror, entry: &AuditLogEntry) {
    let Some(target) = target_for(entry) else {
        return;
    };

    let result = match target {
        MirrorTarget::AccessLog => mirror.record_access(entry).await,
        MirrorTarget::Intrusion => mirror.record_intrusion(entry).await,
    };

    match result {
        Ok(()) => tracing::debug!(id = %entry.outcome.id, ?target, "audit entry mirrored"),
        Err(e) => tracing::warn!(
            id = %entry.outcome.id,
            ?target,
            error = %e,
            "audit mirror failed; entry kept locally"
        ),
    }
}

/// Round to two decimals as the backend stores it (0.8534 -> 0.85).
pub fn round_confidence(confidence: f32) -> f64 {
    (f64::from(confidence) * 100.0).round() / 100.0
}
