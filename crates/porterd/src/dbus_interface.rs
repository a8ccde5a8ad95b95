use crate::enrollment::{EnrollRequest, Enrollment, EnrollmentError};
use crate::gallery::GalleryCache;
use crate::session::SessionStatus;
use porter_core::{AuditLog, OperatingMode};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use zbus::interface;

pub const BUS_NAME: &str = "org.porter.Gate1";
pub const OBJECT_PATH: &str = "/org/porter/Gate1";

/// D-Bus interface for the porter gate daemon.
///
/// Bus name: org.porter.Gate1
/// Object path: /org/porter/Gate1
pub struct GateService {
    pub mode: OperatingMode,
    pub status: watch::Receiver<SessionStatus>,
    pub audit: Arc<Mutex<AuditLog>>,
    pub gallery: Arc<GalleryCache>,
    /// Present only when the gallery comes from the local store.
    pub enrollment: Option<Arc<Enrollment>>,
}

impl GateService {
    fn enrollment(&self) -> zbus::fdo::Result<&Enrollment> {
        self.enrollment.as_deref().ok_or_else(|| {
            zbus::fdo::Error::NotSupported(
                "enrollment requires gallery.source = \"local\"".into(),
            )
        })
    }

    fn audit(&self) -> std::sync::MutexGuard<'_, AuditLog> {
        self.audit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[interface(name = "org.porter.Gate1")]
impl GateService {
    /// Return daemon and session status.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let session = self.status.borrow().clone();
        let gallery = self.gallery.stats().await;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": self.mode,
            "state": session.state,
            "processing": session.processing,
            "halted": session.halted,
            "cycles": session.cycles,
            "displayed": session.latest,
            "gallery": gallery,
        })
        .to_string())
    }

    /// Most recent outcome, or `null`.
    async fn latest_outcome(&self) -> zbus::fdo::Result<String> {
        let latest = self.audit().latest().cloned();
        serde_json::to_string(&latest).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Up to `limit` outcomes, newest first.
    async fn recent_events(&self, limit: u32) -> zbus::fdo::Result<String> {
        let entries = self.audit().recent(limit as usize);
        serde_json::to_string(&entries).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Force a gallery reload and return the number of identities.
    async fn refresh_gallery(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("gallery refresh requested");
        let gallery = self
            .gallery
            .load(true)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(u32::try_from(gallery.len()).unwrap_or(u32::MAX))
    }

    /// Enroll an identity from a photo readable by the daemon.
    async fn enroll(
        &self,
        id: &str,
        display_name: &str,
        unit: &str,
        photo_path: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(id, photo_path, "enroll requested");
        if id.trim().is_empty() || display_name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "id and display name are required".into(),
            ));
        }

        let request = EnrollRequest {
            id: id.to_string(),
            display_name: display_name.to_string(),
            unit: (!unit.is_empty()).then(|| unit.to_string()),
            photo_path: PathBuf::from(photo_path),
        };
        let replaced = self.enrollment()?.enroll(request).await.map_err(to_fdo)?;

        Ok(serde_json::json!({ "id": id, "replaced": replaced }).to_string())
    }

    /// Remove an enrolled identity.
    async fn remove(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove requested");
        self.enrollment()?.remove(id).await.map_err(to_fdo)
    }
}

fn to_fdo(err: EnrollmentError) -> zbus::fdo::Error {
    match err {
        EnrollmentError::Photo { .. } => zbus::fdo::Error::FileNotFound(err.to_string()),
        EnrollmentError::NoFace(_) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        EnrollmentError::Store(_) | EnrollmentError::Extract(_) => {
            zbus::fdo::Error::Failed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::tests::{stored, FakeExtractor, FakeSource};
    use porter_core::{AuditLogEntry, Decision, DecisionPolicy, FaceMatch, Gallery};
    use std::time::Duration;

    fn service() -> GateService {
        let gallery = Arc::new(GalleryCache::new(
            Arc::new(FakeSource::with(vec![
                stored("1", vec![1.0, 0.0]),
                stored("2", vec![0.0, 1.0]),
            ])),
            Arc::new(FakeExtractor),
            Duration::from_secs(300),
        ));
        let (_tx, status) = watch::channel(SessionStatus::default());
        GateService {
            mode: OperatingMode::Access,
            status,
            audit: Arc::new(Mutex::new(AuditLog::with_capacity(10))),
            gallery,
            enrollment: None,
        }
    }

    fn record(service: &GateService, face: FaceMatch) {
        let policy = DecisionPolicy::new(OperatingMode::Access, 0.55);
        let verdict = policy.decide(&face, &Gallery::empty());
        service
            .audit
            .lock()
            .unwrap()
            .append(AuditLogEntry::from_verdict(policy.mode, &verdict));
    }

    #[tokio::test]
    async fn test_status_json() {
        let service = service();
        let status: serde_json::Value =
            serde_json::from_str(&service.status().await.unwrap()).unwrap();
        assert_eq!(status["mode"], "access");
        assert_eq!(status["state"], "waiting");
        assert_eq!(status["processing"], false);
        assert!(status["halted"].is_null());
        assert!(status["version"].is_string());
    }

    #[tokio::test]
    async fn test_latest_and_recent() {
        let service = service();
        assert_eq!(service.latest_outcome().await.unwrap(), "null");

        record(&service, FaceMatch::NoFace { detection_confidence: 0.1 });
        record(&service, FaceMatch::Unknown { distance: 0.9 });

        let latest: AuditLogEntry =
            serde_json::from_str(&service.latest_outcome().await.unwrap()).unwrap();
        assert_eq!(latest.outcome.decision, Decision::Denied);
        assert_eq!(latest.outcome.message, "Face not recognized");

        let recent: Vec<AuditLogEntry> =
            serde_json::from_str(&service.recent_events(1).await.unwrap()).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].outcome.id, latest.outcome.id);
    }

    #[tokio::test]
    async fn test_refresh_gallery_counts_identities() {
        assert_eq!(service().refresh_gallery().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_enroll_without_local_store() {
        let service = service();
        let err = service.remove("1").await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::NotSupported(_)));
        let err = service.enroll("", "x", "", "/tmp/x.jpg").await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }
}
