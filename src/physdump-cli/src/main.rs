mod bridge;
mod config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use physdump::orchestrator::{validate_image_extension, Orchestrator};
use physdump::wait::{await_file, DEFAULT_WAIT_ATTEMPTS};
use physdump_minidump::MinidumpBuilder;

use bridge::BridgeEngine;
use config::{Config, CONFIG_FILE};

#[derive(Parser)]
#[command(name = "physdump")]
#[command(about = "Extract an LSASS minidump from a physical memory capture", long_about = None)]
struct Cli {
    /// Label used to name output files (<label>-<date>-lsass.dmp)
    label: String,

    /// Path to a local capture image (.vmem); when omitted, capture
    /// parameters are read from config.json instead
    #[arg(long)]
    image: Option<PathBuf>,

    /// Directory dump artifacts are written to
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Command used to launch the analysis engine helper
    #[arg(long, default_value = "physdump-engine", value_name = "COMMAND")]
    engine: String,

    /// Seconds between polls for files a companion process produces
    #[arg(long, default_value_t = 1)]
    wait_interval: u64,

    /// Polling attempts before a missing file becomes fatal
    #[arg(long, default_value_t = DEFAULT_WAIT_ATTEMPTS)]
    wait_attempts: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let interval = Duration::from_secs(cli.wait_interval);

    let config = match &cli.image {
        Some(image) => {
            // A wrong extension is fatal before any session gets opened.
            validate_image_extension(image)?;
            println!("[*] Analyzing local image {}", image.display());
            Config::for_image(image.clone())
        }
        None => {
            println!("[*] Loading config from {CONFIG_FILE}");
            Config::load_when_available(Path::new(CONFIG_FILE), interval, cli.wait_attempts)?
        }
    };

    await_file(&config.image, interval, cli.wait_attempts)?;
    println!("[*] Analyzing physical memory");

    let mut engine = BridgeEngine::spawn(&cli.engine, &config.session_config())?;
    let builder = MinidumpBuilder::new();

    let mut orchestrator = Orchestrator::new(cli.label);
    orchestrator.local_image = cli.image;
    orchestrator.output_dir = cli.output_dir;
    orchestrator.build = config.build;
    orchestrator.run(&mut engine, &builder)?;

    Ok(())
}
