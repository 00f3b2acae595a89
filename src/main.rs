use clap::{Args, Parser, Subcommand};
use colored::*;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod artifacts;
mod config;
mod error;
mod net;
mod prepare;
mod server;
mod tracker;
mod version;

use config::ServerConfig;
use server::ArtifactServer;
use tracker::DownloadTracker;
use version::BumpKind;

const DEFAULT_LOG_FILTER: &str = "fwdrop=info";

/// Shared per-server state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    tracker: DownloadTracker,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            tracker: DownloadTracker::new(),
        }
    }
}

#[derive(Parser)]
#[command(name = "fwdrop", version)]
#[command(about = "Serve firmware images to devices for OTA updates", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the firmware image over HTTP (default)
    Serve(ServeArgs),
    /// Bump the firmware version in the source files
    Bump(BumpArgs),
    /// Copy the built firmware into the staging directory
    Prepare(PrepareArgs),
}

#[derive(Args, Clone)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, env = "FWDROP_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Address to bind (all interfaces by default)
    #[arg(long, env = "FWDROP_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Firmware image to serve
    #[arg(short, long, env = "FWDROP_ARTIFACT", default_value = config::DEFAULT_ARTIFACT_PATH)]
    artifact: PathBuf,

    /// Request path the image is served on
    #[arg(short, long, env = "FWDROP_ROUTE", default_value = config::DEFAULT_ROUTE)]
    route: String,

    /// Address prefix of the interface devices should use
    #[arg(long, env = "FWDROP_HIGHLIGHT", default_value = config::DEFAULT_HIGHLIGHT_PREFIX)]
    highlight: String,

    /// Seconds to wait for in-flight downloads on shutdown
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            port: args.port,
            bind: args.bind,
            artifact_path: args.artifact,
            route: args.route,
            highlight_prefix: Some(args.highlight).filter(|p| !p.is_empty()),
            shutdown_grace: Duration::from_secs(args.grace_secs),
        }
    }
}

#[derive(Args)]
struct BumpArgs {
    /// Version component to bump: major or minor
    #[arg(default_value_t = BumpKind::Minor)]
    kind: BumpKind,

    /// Project root the version files are relative to
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Version files to update (defaults to src/main.cpp and src/master.cpp)
    #[arg(short, long = "file")]
    files: Vec<PathBuf>,
}

#[derive(Args)]
struct PrepareArgs {
    /// Built firmware image
    #[arg(short, long, default_value = prepare::DEFAULT_SOURCE)]
    source: PathBuf,

    /// Directory the image is staged into
    #[arg(short, long, default_value = prepare::DEFAULT_DEST_DIR)]
    dest_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Serve(args)) => serve(args).await,
        Some(Command::Bump(args)) => bump(args),
        Some(Command::Prepare(args)) => prepare_firmware(args),
        None => serve(cli.serve).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let server = ArtifactServer::bind(args.into()).await?;
    server.print_banner().await;

    let stats = server.run_until(server::shutdown_signal()).await?;

    println!();
    println!("{}", "Shutting down OTA server...".yellow());
    println!("Total downloads served: {}", stats.total_served);
    println!("{}\n", "Server stopped.".green());
    Ok(())
}

fn bump(args: BumpArgs) -> anyhow::Result<()> {
    let files: Vec<PathBuf> = if args.files.is_empty() {
        version::DEFAULT_VERSION_FILES
            .iter()
            .map(|f| args.root.join(f))
            .collect()
    } else {
        args.files.iter().map(|f| args.root.join(f)).collect()
    };

    let report = version::bump_files(&files, args.kind)?;

    println!(
        "Bumping {} version: {} -> {}",
        report.kind, report.from, report.to
    );
    for file in &report.files {
        println!("  Updated {}", file.display());
    }
    println!("\nVersion bump complete!");
    println!("New version: {}", report.to);
    Ok(())
}

fn prepare_firmware(args: PrepareArgs) -> anyhow::Result<()> {
    println!("=== OTA Firmware Preparation ===\n");

    let prepared = prepare::stage_firmware(&args.source, &args.dest_dir)?;
    info!(path = %prepared.path.display(), bytes = prepared.size_bytes, "Firmware staged");

    println!("{} OTA firmware ready!", "✓".green());
    println!("  Location: {}", prepared.path.display());
    println!("  Size: {:.2} KB", prepared.size_kb());
    Ok(())
}
