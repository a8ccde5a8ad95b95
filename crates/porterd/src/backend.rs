//! HTTP client for the property-management backend.
//!
//! Serves as the remote identity directory (residents with face photos)
//! and as the audit mirror (access logs, intrusion alerts).

use crate::config::BackendConfig;
use crate::directory::{DirectoryError, IdentitySource};
use crate::mirror::{round_confidence, AuditMirror, MirrorError};
use async_trait::async_trait;
use porter_core::{AuditLogEntry, EnrolledIdentity};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

const RESIDENTS_PATH: &str = "/api/users/residents/detail/";
const ACCESS_LOG_PATH: &str = "/api/access-control/logs/";
const INTRUSIONS_PATH: &str = "/api/security/intrusions/";

pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    access_point: String,
    camera_identifier: String,
}

/// Body of `POST /api/access-control/logs/`.
#[derive(Debug, Serialize, PartialEq)]
pub struct AccessLogRequest {
    pub resident_id: Option<i64>,
    pub confidence: f64,
    pub is_authorized: bool,
    pub main_message: String,
    pub detail_message: String,
    pub access_point: String,
}

/// Body of `POST /api/security/intrusions/`.
#[derive(Debug, Serialize, PartialEq)]
pub struct IntrusionAlertRequest {
    pub message: String,
    pub confidence: f64,
    pub camera_identifier: String,
}

impl BackendClient {
    /// Build a client from config. `None` when no base URL is configured.
    pub fn from_config(config: &BackendConfig) -> Result<Option<Self>, reqwest::Error> {
        let Some(base_url) = config.base_url.as_deref() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Some(Self::with_client(client, base_url, config)))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, config: &BackendConfig) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            access_point: config.access_point.clone(),
            camera_identifier: config.camera_identifier.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Absolute URL for a photo reference; relative paths hang off the base.
    fn photo_url(&self, photo: &str) -> String {
        if photo.starts_with("http://") || photo.starts_with("https://") {
            photo.to_string()
        } else if photo.starts_with('/') {
            self.url(photo)
        } else {
            format!("{}/{}", self.base_url, photo)
        }
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// True for URLs on the backend itself. Photos may live on other hosts,
    /// which never see the token.
    fn is_backend_url(&self, url: &str) -> bool {
        url.strip_prefix(self.base_url.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']))
    }

    fn photo_request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        if self.is_backend_url(url) {
            self.with_auth(request)
        } else {
            request
        }
    }

    /// Status code and body of a non-2xx response, or the response itself.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, (u16, String)> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err((status.as_u16(), body));
        }
        Ok(response)
    }

    pub fn access_log_body(&self, entry: &AuditLogEntry) -> AccessLogRequest {
        let authorized = entry.outcome.decision.is_authorized();
        let resident_id = entry
            .identity
            .as_ref()
            .map(|i| i.id.as_str())
            .or(entry.outcome.matched_identity_id.as_deref())
            .and_then(|id| id.parse().ok());
        AccessLogRequest {
            resident_id,
            confidence: round_confidence(entry.outcome.confidence),
            is_authorized: authorized,
            main_message: if authorized { "Authorized" } else { "Unknown" }.to_string(),
            detail_message: entry.outcome.message.clone(),
            access_point: self.access_point.clone(),
        }
    }

    pub fn intrusion_body(&self, entry: &AuditLogEntry) -> IntrusionAlertRequest {
        IntrusionAlertRequest {
            message: entry.outcome.message.clone(),
            confidence: round_confidence(entry.outcome.confidence),
            camera_identifier: self.camera_identifier.clone(),
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), MirrorError> {
        let response = self
            .with_auth(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await?;
        Self::ensure_success(response)
            .await
            .map_err(|(status, body)| MirrorError::Api { status, body })?;
        Ok(())
    }
}

#[async_trait]
impl IdentitySource for BackendClient {
    async fn list(&self) -> Result<Vec<EnrolledIdentity>, DirectoryError> {
        let response = self
            .with_auth(self.client.get(self.url(RESIDENTS_PATH)))
            .send()
            .await?;
        let response = Self::ensure_success(response)
            .await
            .map_err(|(status, body)| DirectoryError::Api { status, body })?;
        let listing: ResidentListing = response.json().await?;

        let records = listing.into_records();
        let total = records.len();
        let identities: Vec<EnrolledIdentity> = records
            .into_iter()
            .filter_map(|r| r.into_identity(self))
            .collect();

        tracing::info!(
            residents = total,
            with_photo = identities.len(),
            "resident directory fetched"
        );
        Ok(identities)
    }

    async fn reference_photo(&self, identity: &EnrolledIdentity) -> Result<Vec<u8>, DirectoryError> {
        let url = identity
            .reference_photo
            .as_deref()
            .ok_or_else(|| DirectoryError::NoPhoto(identity.id.clone()))?;
        let response = self.photo_request(url).send().await?;
        let response = Self::ensure_success(response)
            .await
            .map_err(|(status, body)| DirectoryError::Api { status, body })?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl AuditMirror for BackendClient {
    async fn record_access(&self, entry: &AuditLogEntry) -> Result<(), MirrorError> {
        self.post(ACCESS_LOG_PATH, &self.access_log_body(entry)).await
    }

    async fn record_intrusion(&self, entry: &AuditLogEntry) -> Result<(), MirrorError> {
        self.post(INTRUSIONS_PATH, &self.intrusion_body(entry)).await
    }
}

/// The residents endpoint has answered with several envelope shapes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResidentListing {
    Residents { residents: Vec<ResidentRecord> },
    Data { data: Vec<ResidentRecord> },
    Bare(Vec<ResidentRecord>),
}

impl ResidentListing {
    fn into_records(self) -> Vec<ResidentRecord> {
        match self {
            ResidentListing::Residents { residents } => residents,
            ResidentListing::Data { data } => data,
            ResidentListing::Bare(records) => records,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResidentRecord {
    #[serde(deserialize_with = "id_as_string")]
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    resident_details: Option<ResidentDetails>,
    #[serde(default)]
    profile: Option<ResidentProfile>,
}

#[derive(Debug, Default, Deserialize)]
struct ResidentDetails {
    #[serde(default)]
    house_identifier: Option<String>,
    #[serde(default)]
    face_photo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResidentProfile {
    #[serde(default)]
    resident_info: Option<ResidentDetails>,
}

impl ResidentRecord {
    /// Residents without a face photo cannot be recognised and are dropped.
    fn into_identity(self, backend: &BackendClient) -> Option<EnrolledIdentity> {
        let details = self
            .resident_details
            .or_else(|| self.profile.and_then(|p| p.resident_info))
            .unwrap_or_default();

        let Some(photo) = details.face_photo.filter(|p| !p.trim().is_empty()) else {
            tracing::debug!(id = %self.id, "resident has no face photo; skipped");
            return None;
        };

        let full_name = format!(
            "{} {}",
            self.first_name.unwrap_or_default().trim(),
            self.last_name.unwrap_or_default().trim()
        )
        .trim()
        .to_string();
        let display_name = if !full_name.is_empty() {
            full_name
        } else {
            self.username
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| format!("Resident {}", self.id))
        };

        Some(EnrolledIdentity {
            id: self.id,
            display_name,
            unit: details.house_identifier.filter(|h| !h.is_empty()),
            authorized: self.is_active.unwrap_or(true),
            descriptors: Vec::new(),
            reference_photo: Some(backend.photo_url(&photo)),
        })
    }
}

fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected numeric or string id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_core::{Decision, IdentitySnapshot, OperatingMode, Reason, Verdict};

    fn client() -> BackendClient {
        let config = BackendConfig {
            base_url: Some("https://hub.example.org/".into()),
            token: Some("secret".into()),
            ..Default::default()
        };
        BackendClient::from_config(&config).unwrap().unwrap()
    }

    fn identities(json: &str) -> Vec<EnrolledIdentity> {
        let listing: ResidentListing = serde_json::from_str(json).unwrap();
        let backend = client();
        listing
            .into_records()
            .into_iter()
            .filter_map(|r| r.into_identity(&backend))
            .collect()
    }

    #[test]
    fn test_no_base_url_means_no_client() {
        assert!(BackendClient::from_config(&BackendConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_urls() {
        let backend = client();
        assert_eq!(
            backend.url(RESIDENTS_PATH),
            "https://hub.example.org/api/users/residents/detail/"
        );
        assert_eq!(
            backend.photo_url("/media/faces/7.jpg"),
            "https://hub.example.org/media/faces/7.jpg"
        );
        assert_eq!(
            backend.photo_url("https://cdn.example.org/7.jpg"),
            "https://cdn.example.org/7.jpg"
        );
    }

    #[test]
    fn test_token_only_sent_to_backend_host() {
        let backend = client();
        let authorized = |url: &str| {
            backend
                .photo_request(url)
                .build()
                .unwrap()
                .headers()
                .contains_key(reqwest::header::AUTHORIZATION)
        };
        assert!(authorized("https://hub.example.org/media/faces/7.jpg"));
        assert!(!authorized("https://cdn.example.org/7.jpg"));
        assert!(!authorized("https://hub.example.org.attacker.net/7.jpg"));
        assert!(!authorized("http://hub.example.org/media/faces/7.jpg"));
    }

    #[tokio::test]
    async fn test_foreign_photo_fetch_carries_no_token() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\njpg")
                .await
                .unwrap();
            String::from_utf8_lossy(&request).to_lowercase()
        });

        let identity = EnrolledIdentity {
            id: "7".into(),
            display_name: "Ana Ruiz".into(),
            unit: None,
            authorized: true,
            descriptors: Vec::new(),
            reference_photo: Some(format!("http://127.0.0.1:{port}/x.jpg")),
        };
        let photo = client().reference_photo(&identity).await.unwrap();
        assert_eq!(photo, b"jpg");

        let request = server.await.unwrap();
        assert!(request.starts_with("get /x.jpg"), "{request}");
        assert!(!request.contains("authorization"), "{request}");
    }

    #[test]
    fn test_residents_envelope() {
        let parsed = identities(
            r#"{"residents": [
                {"id": 7, "first_name": "Ana", "last_name": "Ruiz", "is_active": true,
                 "resident_details": {"house_identifier": "Casa 4", "face_photo": "/media/7.jpg"}},
                {"id": 8, "first_name": "Luis", "last_name": "Vega",
                 "resident_details": {"house_identifier": "Casa 9"}}
            ]}"#,
        );
        assert_eq!(parsed.len(), 1);
        let ana = &parsed[0];
        assert_eq!(ana.id, "7");
        assert_eq!(ana.display_name, "Ana Ruiz");
        assert_eq!(ana.unit.as_deref(), Some("Casa 4"));
        assert!(ana.authorized);
        assert_eq!(
            ana.reference_photo.as_deref(),
            Some("https://hub.example.org/media/7.jpg")
        );
    }

    #[test]
    fn test_bare_array_with_profile() {
        let parsed = identities(
            r#"[{"id": "12", "username": "mrios", "is_active": false,
                 "profile": {"resident_info": {"face_photo": "https://cdn/x.jpg"}}}]"#,
        );
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "12");
        assert_eq!(parsed[0].display_name, "mrios");
        assert!(!parsed[0].authorized);
        assert!(parsed[0].unit.is_none());
    }

    #[test]
    fn test_data_envelope() {
        let parsed = identities(
            r#"{"data": [{"id": 3, "resident_details": {"face_photo": "p.jpg"}}]}"#,
        );
        assert_eq!(parsed[0].display_name, "Resident 3");
        assert_eq!(
            parsed[0].reference_photo.as_deref(),
            Some("https://hub.example.org/p.jpg")
        );
    }

    #[test]
    fn test_bad_id_is_rejected() {
        assert!(serde_json::from_str::<ResidentListing>(r#"[{"id": true}]"#).is_err());
    }

    fn entry(decision: Decision, identity: Option<&str>) -> AuditLogEntry {
        let verdict = Verdict {
            decision,
            reason: Reason::Recognized,
            confidence: 0.8534567,
            matched_identity_id: identity.map(str::to_string),
            identity: identity.map(|id| IdentitySnapshot {
                id: id.into(),
                display_name: "Ana Ruiz".into(),
                unit: None,
            }),
            message: "Access granted to Ana Ruiz".into(),
        };
        AuditLogEntry::from_verdict(OperatingMode::Access, &verdict)
    }

    #[test]
    fn test_access_log_body() {
        let body = client().access_log_body(&entry(Decision::Authorized, Some("7")));
        assert_eq!(
            body,
            AccessLogRequest {
                resident_id: Some(7),
                confidence: 0.85,
                is_authorized: true,
                main_message: "Authorized".into(),
                detail_message: "Access granted to Ana Ruiz".into(),
                access_point: "Main Gate".into(),
            }
        );

        let denied = client().access_log_body(&entry(Decision::Denied, None));
        assert_eq!(denied.resident_id, None);
        assert!(!denied.is_authorized);
        assert_eq!(denied.main_message, "Unknown");
    }

    #[test]
    fn test_intrusion_body() {
        let body = client().intrusion_body(&entry(Decision::Intruder, None));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["camera_identifier"], "CAM-MAIN-01");
        assert_eq!(json["confidence"], 0.85);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_request_error() {
        let config = BackendConfig {
            base_url: Some("http://127.0.0.1:9".into()),
            timeout_secs: 2,
            ..Default::default()
        };
        let backend = BackendClient::from_config(&config).unwrap().unwrap();
        assert!(matches!(backend.list().await, Err(DirectoryError::Request(_))));
        assert!(matches!(
            backend.record_access(&entry(Decision::Denied, None)).await,
            Err(MirrorError::Request(_))
        ));
    }
}
