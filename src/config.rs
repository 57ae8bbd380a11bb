//! Runtime settings for the server and client.
//!
//! Both binaries build these from their command line arguments; library users
//! can start from [`Default`] and override individual fields.
use std::{path::PathBuf, time::Duration};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long a read may wait on an idle peer before the connection is
    /// dropped.
    pub idle_timeout: Duration,
    /// Directory holding staged inputs and processor outputs.
    pub staging_dir: PathBuf,
    /// `ffmpeg` executable used by the default processor.
    pub ffmpeg: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            idle_timeout: Duration::from_secs(30),
            staging_dir: PathBuf::from("tmp"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Socket timeout while waiting on the server. `None` waits as long as
    /// processing takes.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeout: None,
        }
    }
}
