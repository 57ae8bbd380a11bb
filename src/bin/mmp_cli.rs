use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use mmp::{Action, ActionArgs, ClientConfig, MediaClient, config, protocol::ClientError};

#[derive(Debug, Parser)]
#[command(version, about = "Send a video to a Media Message Protocol server", long_about = None)]
struct Cli {
    /// Video to process (mp4, avi, mov or mkv)
    file: PathBuf,
    /// Server host
    #[arg(long, default_value = config::DEFAULT_HOST)]
    host: String,
    /// Server port
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,
    /// Processing to apply
    #[arg(long, value_enum)]
    action: Action,
    /// Target width, for resize
    #[arg(long)]
    width: Option<u32>,
    /// Target height, for resize
    #[arg(long)]
    height: Option<u32>,
    /// Target ratio such as 16:9, for aspect
    #[arg(long)]
    aspect_ratio: Option<String>,
    /// Clip start such as 00:00:05, for gif and webm
    #[arg(long)]
    start_time: Option<String>,
    /// Clip length such as 00:00:03, for gif and webm
    #[arg(long)]
    duration: Option<String>,
    /// Seconds to wait on the server before giving up
    #[arg(long)]
    timeout: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let args = ActionArgs {
        width: cli.width,
        height: cli.height,
        aspect_ratio: cli.aspect_ratio,
        start_time: cli.start_time,
        duration: cli.duration,
    };

    let result = cli
        .action
        .operation(&args)
        .map_err(ClientError::from)
        .and_then(|operation| {
            let client = MediaClient::new(ClientConfig {
                host: cli.host,
                port: cli.port,
                timeout: cli.timeout.map(Duration::from_secs),
            });
            client.submit(&cli.file, operation)
        });

    match result {
        Ok(output) => {
            println!("processed file saved to {}", output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
