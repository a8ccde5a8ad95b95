use porter_core::OperatingMode;
use porter_hw::MotionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Config file used when `PORTER_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/porter/porterd.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration: TOML file, then `PORTER_*` environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub motion: MotionConfig,
    pub session: SessionConfig,
    pub recognition: RecognitionConfig,
    pub gallery: GalleryConfig,
    pub backend: BackendConfig,
    pub audit: AuditConfig,
    pub dbus: DbusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// V4L2 device path.
    pub device: String,
    /// Frames discarded after the stream starts (AGC/AE settling).
    pub warmup_frames: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            warmup_frames: 4,
        }
    }
}

/// Recognition loop timing, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    /// Pause between motion and the probe capture.
    pub settle_delay_ms: u64,
    /// How long an authorized outcome stays on display.
    pub dwell_success_ms: u64,
    /// How long any other outcome stays on display.
    pub dwell_failure_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            settle_delay_ms: 1000,
            dwell_success_ms: 3000,
            dwell_failure_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub mode: OperatingMode,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Largest cosine distance still counted as a match.
    pub match_threshold: f32,
    /// Minimum confidence for the policy to authorize.
    pub decision_threshold: f32,
    /// Probe detections scoring below this are treated as no face.
    pub min_detection_confidence: f32,
    /// Same, for gallery reference photos.
    pub gallery_detection_confidence: f32,
    pub contrast: f32,
    pub brightness: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Access,
            model_dir: porter_core::default_model_dir(),
            match_threshold: 0.6,
            decision_threshold: 0.55,
            min_detection_confidence: 0.5,
            gallery_detection_confidence: 0.3,
            contrast: 1.1,
            brightness: 10.0,
        }
    }
}

/// Where enrolled identities come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GallerySource {
    /// JSON file managed through `porter enroll` / `porter remove`.
    Local,
    /// Resident directory of the property-management backend.
    Backend,
}

impl FromStr for GallerySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(GallerySource::Local),
            "backend" => Ok(GallerySource::Backend),
            other => Err(format!("unknown gallery source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    pub source: GallerySource,
    /// Local identity store (always used for enrollment).
    pub store_path: PathBuf,
    /// Seconds a loaded gallery stays fresh.
    pub ttl_secs: u64,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            source: GallerySource::Local,
            store_path: PathBuf::from("/var/lib/porter/identities.json"),
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://hub.example.org`. Unset disables the backend.
    pub base_url: Option<String>,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// Forward audit entries to the backend.
    pub mirror: bool,
    pub access_point: String,
    pub camera_identifier: String,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            mirror: true,
            access_point: "Main Gate".to_string(),
            camera_identifier: "CAM-MAIN-01".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: porter_core::audit::DEFAULT_AUDIT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DbusConfig {
    pub bus: BusKind,
}

impl Config {
    /// Load from `PORTER_CONFIG` (or the default path), apply environment
    /// overrides and validate. A missing file means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("PORTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };

        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override settings from `PORTER_*` variables resolved through `lookup`.
    /// Unparsable values are logged and ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PORTER_CAMERA_DEVICE") {
            self.camera.device = v;
        }
        if let Some(v) = lookup("PORTER_MODEL_DIR") {
            self.recognition.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PORTER_STORE_PATH") {
            self.gallery.store_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PORTER_BACKEND_URL") {
            self.backend.base_url = Some(v);
        }
        if let Some(v) = lookup("PORTER_BACKEND_TOKEN") {
            self.backend.token = Some(v);
        }

        set_parsed(&lookup, "PORTER_WARMUP_FRAMES", &mut self.camera.warmup_frames);
        set_parsed(&lookup, "PORTER_MODE", &mut self.recognition.mode);
        set_parsed(&lookup, "PORTER_MATCH_THRESHOLD", &mut self.recognition.match_threshold);
        set_parsed(
            &lookup,
            "PORTER_DECISION_THRESHOLD",
            &mut self.recognition.decision_threshold,
        );
        set_parsed(
            &lookup,
            "PORTER_MIN_DETECTION_CONFIDENCE",
            &mut self.recognition.min_detection_confidence,
        );
        set_parsed(&lookup, "PORTER_GALLERY_SOURCE", &mut self.gallery.source);
        set_parsed(&lookup, "PORTER_GALLERY_TTL_SECS", &mut self.gallery.ttl_secs);
        set_parsed(&lookup, "PORTER_DBUS_BUS", &mut self.dbus.bus);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.recognition;
        unit_interval("recognition.decision_threshold", r.decision_threshold)?;
        unit_interval("recognition.min_detection_confidence", r.min_detection_confidence)?;
        unit_interval(
            "recognition.gallery_detection_confidence",
            r.gallery_detection_confidence,
        )?;
        if !(r.match_threshold > 0.0 && r.match_threshold <= 2.0) {
            return Err(invalid(
                "recognition.match_threshold",
                format!("{} is outside (0, 2]", r.match_threshold),
            ));
        }
        if r.contrast.is_nan() || r.contrast <= 0.0 {
            return Err(invalid("recognition.contrast", "must be positive".into()));
        }

        let m = &self.motion;
        if !(m.changed_fraction > 0.0 && m.changed_fraction <= 1.0) {
            return Err(invalid(
                "motion.changed_fraction",
                format!("{} is outside (0, 1]", m.changed_fraction),
            ));
        }
        if m.stride == 0 {
            return Err(invalid("motion.stride", "must be at least 1".into()));
        }

        if self.session.poll_interval_ms == 0 {
            return Err(invalid("session.poll_interval_ms", "must be positive".into()));
        }
        if self.audit.capacity == 0 {
            return Err(invalid("audit.capacity", "must be at least 1".into()));
        }
        if self.gallery.source == GallerySource::Backend && self.backend.base_url.is_none() {
            return Err(invalid(
                "gallery.source",
                "backend source requires backend.base_url".into(),
            ));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.recognition
            .model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.recognition
            .model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn gallery_ttl(&self) -> Duration {
        Duration::from_secs(self.gallery.ttl_secs)
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

fn unit_interval(key: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(key, format!("{value} is outside [0, 1]")))
    }
}

fn invalid(key: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { key, reason }
}
