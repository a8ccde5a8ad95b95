use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use porter_hw::{Camera, FrameSource, MotionConfig, MotionDetector, V4lFrameSource};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "porter", about = "Porter access-control gate CLI")]
struct Cli {
    /// Talk to porterd on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon and session status
    Status,
    /// Show the most recent recognition outcome
    Latest,
    /// List recent recognition outcomes, newest first
    Events {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: u32,
    },
    /// Reload the gallery from its source
    Refresh,
    /// Enroll an identity from a photo
    Enroll {
        #[arg(long)]
        id: String,
        /// Display name shown on recognition
        #[arg(long)]
        name: String,
        /// House or unit identifier
        #[arg(long)]
        unit: Option<String>,
        /// Photo containing exactly the face to enroll
        photo: PathBuf,
    },
    /// Remove an enrolled identity
    Remove {
        id: String,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera and motion diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 10)]
        frames: u32,
        /// Save the last captured frame as an image
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

// `#[zbus::proxy]` generates `GateProxy` (async) and `GateProxyBlocking`.
#[zbus::proxy(
    interface = "org.porter.Gate1",
    default_service = "org.porter.Gate1",
    default_path = "/org/porter/Gate1"
)]
trait Gate {
    async fn status(&self) -> zbus::Result<String>;
    async fn latest_outcome(&self) -> zbus::Result<String>;
    async fn recent_events(&self, limit: u32) -> zbus::Result<String>;
    async fn refresh_gallery(&self) -> zbus::Result<u32>;
    async fn enroll(
        &self,
        id: &str,
        display_name: &str,
        unit: &str,
        photo_path: &str,
    ) -> zbus::Result<String>;
    async fn remove(&self, id: &str) -> zbus::Result<bool>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => print_json(&connect(cli.session).await?.status().await?),
        Commands::Latest => print_json(&connect(cli.session).await?.latest_outcome().await?),
        Commands::Events { limit } => {
            print_json(&connect(cli.session).await?.recent_events(limit).await?)
        }
        Commands::Refresh => {
            let count = connect(cli.session).await?.refresh_gallery().await?;
            println!("Gallery reloaded: {count} identities");
            Ok(())
        }
        Commands::Enroll {
            id,
            name,
            unit,
            photo,
        } => {
            // The daemon resolves the path, so hand it an absolute one.
            let photo = photo
                .canonicalize()
                .with_context(|| format!("cannot resolve {}", photo.display()))?;
            let reply = connect(cli.session)
                .await?
                .enroll(
                    &id,
                    &name,
                    unit.as_deref().unwrap_or(""),
                    &photo.to_string_lossy(),
                )
                .await?;
            print_json(&reply)
        }
        Commands::Remove { id } => {
            if connect(cli.session).await?.remove(&id).await? {
                println!("Removed {id}");
            } else {
                println!("No identity with id {id}");
            }
            Ok(())
        }
        Commands::Devices => list_devices(),
        Commands::Test {
            device,
            frames,
            save,
        } => camera_test(&device, frames, save.as_deref()),
    }
}

async fn connect(session_bus: bool) -> Result<GateProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    GateProxy::new(&conn)
        .await
        .context("porterd is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("malformed reply")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn camera_test(device: &str, frames: u32, save: Option<&std::path::Path>) -> Result<()> {
    println!("Testing {device}...");
    let mut source = V4lFrameSource::new(device);
    source.start()?;

    let mut motion = MotionDetector::new(MotionConfig::default());
    let mut last = None;
    for _ in 0..frames {
        let frame = source.capture()?;
        let moved = motion.sample(&frame);
        println!(
            "frame {:>3}  {}x{}  brightness {:>5.1}  motion {}",
            frame.sequence,
            frame.width,
            frame.height,
            frame.avg_brightness(),
            if moved { "yes" } else { "no" }
        );
        last = Some(frame);
    }
    source.stop();

    if let (Some(path), Some(frame)) = (save, last) {
        let image = image::RgbImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image
            .save(path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        println!("Saved last frame to {}", path.display());
    }
    Ok(())
}
