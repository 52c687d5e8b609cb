use anyhow::{Context, Result};
use clap::Parser;
use photoid_service::{ServiceConfig, TempFileManager};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "sweep-temp",
    version = "0.1.0",
    about = "Remove stale files from the photo preview temp directory"
)]
struct Args {
    /// Temp directory to sweep (defaults to TEMP_DIR)
    #[arg(short, long)]
    temp_dir: Option<PathBuf>,

    /// Maximum file age in seconds (defaults to CLEANUP_MAX_AGE_SECONDS)
    #[arg(short, long)]
    max_age: Option<u64>,

    /// List expired files without deleting them
    #[arg(long)]
    dry_run: bool,
}

fn setup_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sweep_temp=debug,photoid_service=debug"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    setup_tracing();
    let args = Args::parse();

    let config = ServiceConfig::from_env();
    let temp_dir = args.temp_dir.unwrap_or(config.temp_dir);
    let max_age = args
        .max_age
        .map(Duration::from_secs)
        .unwrap_or(config.cleanup_max_age);

    let manager = TempFileManager::new(temp_dir.clone());

    if args.dry_run {
        let expired = manager
            .expired_files(max_age)
            .await
            .with_context(|| format!("Failed to scan {}", temp_dir.display()))?;
        for path in &expired {
            println!("{}", path.display());
        }
        info!(
            "{} files older than {}s in {}",
            expired.len(),
            max_age.as_secs(),
            temp_dir.display()
        );
        return Ok(());
    }

    let report = manager.sweep(max_age).await;
    info!(
        "Swept {}: {} expired, {} removed, {} failed",
        temp_dir.display(),
        report.scanned,
        report.removed,
        report.failed
    );

    if report.failed > 0 {
        return Err(anyhow::anyhow!(
            "Failed to remove {} expired files",
            report.failed
        ));
    }

    Ok(())
}
