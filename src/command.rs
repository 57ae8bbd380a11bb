//! Client-side command model.
//!
//! This module turns what a user asks for on the command line into an
//! [`Operation`] the server understands, and checks the input file before
//! anything is sent over the network.
//!
//! # Overview
//! The [`Action`] enum mirrors the command line `--action` values:
//!
//! - `compress`: Re-encode the video at a smaller size.
//! - `resize`: Scale to `--width` x `--height`.
//! - `aspect`: Fit into `--aspect-ratio`, e.g. `16:9`.
//! - `audio`: Extract the audio track as mp3.
//! - `gif` / `webm`: Cut `--duration` starting at `--start-time` into an animation.
//!
//! Unlike the server, which fills in defaults for absent parameters, the
//! client insists that the parameters an action depends on are given.
//!
//! # Example
//! ```rust
//! use mmp::command::{Action, ActionArgs};
//! use mmp::operation::Operation;
//!
//! let args = ActionArgs { width: Some(640), height: Some(360), ..Default::default() };
//! let operation = Action::Resize.operation(&args).unwrap();
//! assert_eq!(operation, Operation::ResizeResolution { width: 640, height: 360 });
//! ```
use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use thiserror::Error;

use crate::operation::{AspectRatio, Clip, Operation};

/// Extensions accepted as input.
pub const SUPPORTED_FORMATS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Inputs must be smaller than this many bytes.
pub const MAX_INPUT_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// List of possible errors that a command can throw.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("'{action}' requires {reason}")]
    MissingArguments {
        action: &'static str,
        reason: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file {0:?} does not exist")]
    FileNotFound(PathBuf),

    #[error("unsupported file format '{0}'; expected one of mp4, avi, mov, mkv")]
    UnsupportedFormat(String),

    #[error("file is {size} bytes; must be less than {max}")]
    FileTooLarge { size: u64, max: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    Compress,
    Resize,
    Aspect,
    Audio,
    Gif,
    Webm,
}

/// Optional parameters supplied alongside an [`Action`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionArgs {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub aspect_ratio: Option<String>,
    pub start_time: Option<String>,
    pub duration: Option<String>,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Compress => "compress",
            Action::Resize => "resize",
            Action::Aspect => "aspect",
            Action::Audio => "audio",
            Action::Gif => "gif",
            Action::Webm => "webm",
        }
    }

    pub fn operation(&self, args: &ActionArgs) -> Result<Operation, CommandError> {
        match self {
            Action::Compress => Ok(Operation::Compress),
            Action::Audio => Ok(Operation::ExtractAudio),
            Action::Resize => match (args.width, args.height) {
                (Some(width), Some(height)) if width > 0 && height > 0 => {
                    Ok(Operation::ResizeResolution { width, height })
                }
                (Some(_), Some(_)) => Err(CommandError::InvalidArgument(
                    "width and height must be positive".into(),
                )),
                _ => Err(CommandError::MissingArguments {
                    action: self.name(),
                    reason: "--width and --height",
                }),
            },
            Action::Aspect => {
                let raw = args
                    .aspect_ratio
                    .as_deref()
                    .ok_or(CommandError::MissingArguments {
                        action: self.name(),
                        reason: "--aspect-ratio, e.g. '16:9'",
                    })?;
                let aspect_ratio: AspectRatio = raw
                    .parse()
                    .map_err(|e: crate::operation::DispatchError| {
                        CommandError::InvalidArgument(e.to_string())
                    })?;
                Ok(Operation::ChangeAspectRatio { aspect_ratio })
            }
            Action::Gif | Action::Webm => {
                let (Some(start_time), Some(duration)) = (&args.start_time, &args.duration) else {
                    return Err(CommandError::MissingArguments {
                        action: self.name(),
                        reason: "--start-time and --duration",
                    });
                };

                let clip = Clip::new(start_time.as_str(), duration.as_str());
                if *self == Action::Gif {
                    Ok(Operation::CreateGif(clip))
                } else {
                    Ok(Operation::CreateWebm(clip))
                }
            }
        }
    }
}

/// Checks that `path` is an existing, supported, small enough media file.
/// Returns its lowercased extension and size.
pub fn validate_input(path: &Path) -> Result<(String, u64), CommandError> {
    let metadata = fs::metadata(path).map_err(|_| CommandError::FileNotFound(path.into()))?;
    if !metadata.is_file() {
        return Err(CommandError::FileNotFound(path.into()));
    }

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_FORMATS.contains(&extension.as_str()) {
        return Err(CommandError::UnsupportedFormat(extension));
    }

    if metadata.len() > MAX_INPUT_SIZE {
        return Err(CommandError::FileTooLarge {
            size: metadata.len(),
            max: MAX_INPUT_SIZE,
        });
    }

    Ok((extension, metadata.len()))
}
