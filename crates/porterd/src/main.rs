use anyhow::{Context, Result};
use config::{BusKind, Config, GallerySource};
use porter_core::{AuditLog, DecisionPolicy};
use porter_hw::{MotionDetector, V4lFrameSource};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod dbus_interface;
mod directory;
mod engine;
mod enrollment;
mod gallery;
mod matcher;
mod mirror;
mod session;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("porterd starting");

    let config = Config::load()?;
    let mode = config.recognition.mode;
    tracing::info!(
        %mode,
        camera = %config.camera.device,
        gallery = ?config.gallery.source,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&engine::EngineSettings {
        scrfd_path: config.scrfd_model_path(),
        arcface_path: config.arcface_model_path(),
        contrast: config.recognition.contrast,
        brightness: config.recognition.brightness,
    })
    .context("failed to start recognition engine")?;

    let store = Arc::new(store::LocalStore::new(&config.gallery.store_path));
    let backend = backend::BackendClient::from_config(&config.backend)
        .context("failed to build backend client")?
        .map(Arc::new);

    let source: Arc<dyn directory::IdentitySource> = match (config.gallery.source, &backend) {
        (GallerySource::Local, _) => store.clone(),
        (GallerySource::Backend, Some(client)) => client.clone(),
        (GallerySource::Backend, None) => anyhow::bail!("backend gallery source has no base URL"),
    };
    let mirror: Option<Arc<dyn mirror::AuditMirror>> = match &backend {
        Some(client) if config.backend.mirror => Some(client.clone()),
        _ => None,
    };

    let extractor: Arc<dyn gallery::DescriptorExtractor> = Arc::new(gallery::EngineExtractor::new(
        engine.clone(),
        config.recognition.gallery_detection_confidence,
    ));
    let gallery = Arc::new(gallery::GalleryCache::new(
        source,
        extractor.clone(),
        config.gallery_ttl(),
    ));
    let enrollment = (config.gallery.source == GallerySource::Local).then(|| {
        Arc::new(enrollment::Enrollment::new(
            store.clone(),
            extractor,
            gallery.clone(),
        ))
    });

    // Warm the cache; a failure here is retried on the first cycle.
    match gallery.load(false).await {
        Ok(g) => tracing::info!(identities = g.len(), roster = g.roster_len(), "gallery loaded"),
        Err(e) => tracing::warn!(error = %e, "initial gallery load failed"),
    }

    let audit = Arc::new(Mutex::new(AuditLog::with_capacity(config.audit.capacity)));
    let handle = session::Session::spawn(session::SessionParts {
        source: Box::new(
            V4lFrameSource::new(config.camera.device.clone())
                .with_warmup(config.camera.warmup_frames),
        ),
        motion: MotionDetector::new(config.motion.clone()),
        matcher: Arc::new(matcher::EngineMatcher::new(
            engine,
            config.recognition.min_detection_confidence,
            config.recognition.match_threshold,
        )),
        gallery: gallery.clone(),
        policy: DecisionPolicy::new(mode, config.recognition.decision_threshold),
        audit: audit.clone(),
        mirror,
        timing: session::SessionTiming::from(&config.session),
    });

    let service = dbus_interface::GateService {
        mode,
        status: handle.subscribe(),
        audit,
        gallery,
        enrollment,
    };
    let builder = match config.dbus.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.dbus.bus, "porterd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("porterd shutting down");
    handle.shutdown().await;

    Ok(())
}
