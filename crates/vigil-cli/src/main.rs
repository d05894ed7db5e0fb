use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vigil_hw::Camera;

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil security monitor CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a monitoring session
    Start,
    /// Stop the running session
    Stop,
    /// Show daemon status
    Status,
    /// Show the latest detections
    Predictions,
    /// List stored events, newest first
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Enroll a known person from an embedding file (JSON array of floats)
    Enroll {
        #[arg(long)]
        first: String,
        #[arg(long)]
        last: String,
        #[arg(long)]
        embedding: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
    /// Capture one frame straight from a camera (bypasses the daemon)
    Snapshot {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value = "snapshot.png")]
        output: PathBuf,
    },
}

#[zbus::proxy(
    interface = "org.vigil.Monitor1",
    default_service = "org.vigil.Monitor1",
    default_path = "/org/vigil/Monitor1"
)]
trait Monitor {
    fn start(&self) -> zbus::Result<String>;
    fn stop(&self) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
    fn predictions(&self) -> zbus::Result<String>;
    fn list_events(&self, limit: u32) -> zbus::Result<String>;
    fn enroll_member(&self, first_name: &str, last_name: &str, embedding_json: &str) -> zbus::Result<i64>;
}

async fn connect() -> Result<MonitorProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    tracing::debug!(unique_name = ?conn.unique_name(), "connected to session bus");
    MonitorProxy::new(&conn)
        .await
        .context("vigild is not reachable on the session bus")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let session = connect().await?.start().await?;
            println!("Monitoring started (session {session})");
        }
        Commands::Stop => {
            connect().await?.stop().await?;
            println!("Monitoring stopped");
        }
        Commands::Status => print_json(&connect().await?.status().await?)?,
        Commands::Predictions => print_json(&connect().await?.predictions().await?)?,
        Commands::Events { limit } => print_json(&connect().await?.list_events(limit).await?)?,
        Commands::Enroll {
            first,
            last,
            embedding,
        } => {
            let text = std::fs::read_to_string(&embedding)
                .with_context(|| format!("failed to read {}", embedding.display()))?;
            let values: Vec<f32> = serde_json::from_str(&text)
                .with_context(|| format!("{} is not a JSON array of numbers", embedding.display()))?;
            if values.is_empty() {
                bail!("{} contains an empty embedding", embedding.display());
            }
            let id = connect()
                .await?
                .enroll_member(&first, &last, &serde_json::to_string(&values)?)
                .await?;
            println!("Enrolled {first} {last} as member {id} ({} dimensions)", values.len());
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            tracing::debug!(count = devices.len(), "enumerated capture devices");
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path.display(), dev.card, dev.driver, dev.bus);
            }
        }
        Commands::Snapshot { device, output } => {
            let camera = Camera::open(&device)?;
            let frame = camera.capture_frame()?;
            tracing::debug!(
                device,
                sequence = frame.sequence,
                bytes = frame.data.len(),
                "snapshot frame captured"
            );
            let image = image::RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec())
                .context("captured frame has an unexpected size")?;
            image
                .save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "Saved {}x{} frame from {device} ({:?}) to {}",
                frame.width,
                frame.height,
                camera.format,
                output.display()
            );
        }
    }

    Ok(())
}
