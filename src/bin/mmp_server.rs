use std::{error::Error, path::PathBuf, time::Duration};

use clap::Parser;
use log::info;
use mmp::{MediaServer, ServerConfig, config};

#[derive(Debug, Parser)]
#[command(version, about = "Media Message Protocol processing server", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = config::DEFAULT_HOST)]
    host: String,
    /// Port to listen on
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,
    /// Seconds a connection may sit idle before it is dropped; 0 disables
    #[arg(long, default_value_t = 30)]
    idle_timeout: u64,
    /// Directory for staged uploads and processed outputs
    #[arg(long, default_value = "tmp")]
    staging_dir: PathBuf,
    /// ffmpeg executable
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        idle_timeout: Duration::from_secs(cli.idle_timeout),
        staging_dir: cli.staging_dir,
        ffmpeg: cli.ffmpeg,
    };

    let server = MediaServer::with_ffmpeg(&config)?;
    let handle = server.shutdown_handle()?;
    ctrlc::set_handler(move || {
        info!("interrupted; finishing in-flight requests");
        handle.shutdown();
    })?;

    server.listen()?;
    Ok(())
}
