//! Process entry point: parse CLI args, load settings and configuration,
//! initialize logging, and hand off to the supervisor's accept loop.

use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vdicomprint::{ConfigView, Settings};

#[derive(Parser, Debug)]
#[command(name = "virtual-dicom-printer", about = "A virtual DICOM print SCP")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "VDICOMPRINT_CONFIG", default_value = "/etc/vdicomprint.toml")]
    config: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.clone())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ConfigView::load(&args.config)?;

    vdicomprint::run(settings, config).await?;
    Ok(())
}
