//! Operations a client can request and their dispatch to a [`Processor`].
//!
//! The set of operations is closed: an identifier either maps onto an
//! [`OperationKind`] or the request is rejected as unknown before anything is
//! handed to the processor. Each kind owns the parameters it reads from the
//! request metadata and the defaults applied when they are absent:
//!
//! | identifier            | parameters (default)                    | output |
//! |-----------------------|-----------------------------------------|--------|
//! | `compress`            |                                         | `mp4`  |
//! | `resize_resolution`   | `width` (1920), `height` (1080)         | `mp4`  |
//! | `change_aspect_ratio` | `aspect_ratio` (`"16:9"`)               | `mp4`  |
//! | `extract_audio`       |                                         | `mp3`  |
//! | `create_gif`          | `start_time` (`"00:00:00"`), `duration` (`"00:00:10"`) | `gif`  |
//! | `create_webm`         | `start_time` (`"00:00:00"`), `duration` (`"00:00:10"`) | `webm` |
use std::{
    ffi::OsStr,
    fmt, fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use log::{info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{
    processor::Processor,
    protocol::{
        ErrorCode, ErrorRecord, Metadata,
        header::{MAX_MEDIA_TYPE_SIZE, MAX_PAYLOAD_SIZE},
        request::{ASPECT_RATIO, DURATION, HEIGHT, PROCESS_TYPE, START_TIME, WIDTH},
        thread::panic_message,
    },
    staging::StagedFiles,
};

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_ASPECT_RATIO: &str = "16:9";
pub const DEFAULT_START_TIME: &str = "00:00:00";
pub const DEFAULT_DURATION: &str = "00:00:10";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("request does not name an operation")]
    MissingOperation,

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameters { name: &'static str, reason: String },

    #[error("processing failed: {0}")]
    ProcessingFailed(String),
}

impl DispatchError {
    pub fn record(&self) -> ErrorRecord {
        match self {
            DispatchError::MissingOperation => ErrorRecord::new(
                ErrorCode::BadRequest,
                "Missing process type",
                "Please specify a process type",
            ),
            DispatchError::UnknownOperation(_) => ErrorRecord::new(
                ErrorCode::BadRequest,
                "Invalid process type",
                "Please specify a valid process type",
            ),
            DispatchError::InvalidParameters { .. } => ErrorRecord::new(
                ErrorCode::BadRequest,
                "Invalid parameters",
                self.to_string(),
            ),
            DispatchError::ProcessingFailed(message) => {
                ErrorRecord::new(ErrorCode::Internal, "Processing failed", message.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Compress,
    ResizeResolution,
    ChangeAspectRatio,
    ExtractAudio,
    CreateGif,
    CreateWebm,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Compress,
        OperationKind::ResizeResolution,
        OperationKind::ChangeAspectRatio,
        OperationKind::ExtractAudio,
        OperationKind::CreateGif,
        OperationKind::CreateWebm,
    ];

    pub fn identifier(&self) -> &'static str {
        match self {
            OperationKind::Compress => "compress",
            OperationKind::ResizeResolution => "resize_resolution",
            OperationKind::ChangeAspectRatio => "change_aspect_ratio",
            OperationKind::ExtractAudio => "extract_audio",
            OperationKind::CreateGif => "create_gif",
            OperationKind::CreateWebm => "create_webm",
        }
    }

    /// Media type of the artifact this kind of operation produces.
    pub fn output_kind(&self) -> &'static str {
        match self {
            OperationKind::Compress
            | OperationKind::ResizeResolution
            | OperationKind::ChangeAspectRatio => "mp4",
            OperationKind::ExtractAudio => "mp3",
            OperationKind::CreateGif => "gif",
            OperationKind::CreateWebm => "webm",
        }
    }

    fn parse(&self, metadata: &Metadata) -> Result<Operation, DispatchError> {
        let operation = match self {
            OperationKind::Compress => Operation::Compress,
            OperationKind::ResizeResolution => Operation::ResizeResolution {
                width: dimension(metadata, WIDTH, DEFAULT_WIDTH)?,
                height: dimension(metadata, HEIGHT, DEFAULT_HEIGHT)?,
            },
            OperationKind::ChangeAspectRatio => {
                let raw = text(metadata, ASPECT_RATIO, DEFAULT_ASPECT_RATIO)?;
                Operation::ChangeAspectRatio {
                    aspect_ratio: raw.parse()?,
                }
            }
            OperationKind::ExtractAudio => Operation::ExtractAudio,
            OperationKind::CreateGif => Operation::CreateGif(clip(metadata)?),
            OperationKind::CreateWebm => Operation::CreateWebm(clip(metadata)?),
        };
        Ok(operation)
    }
}

impl FromStr for OperationKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.identifier() == s)
            .ok_or_else(|| DispatchError::UnknownOperation(s.to_string()))
    }
}

/// A fully parameterised operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Compress,
    ResizeResolution { width: u32, height: u32 },
    ChangeAspectRatio { aspect_ratio: AspectRatio },
    ExtractAudio,
    CreateGif(Clip),
    CreateWebm(Clip),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Compress => OperationKind::Compress,
            Operation::ResizeResolution { .. } => OperationKind::ResizeResolution,
            Operation::ChangeAspectRatio { .. } => OperationKind::ChangeAspectRatio,
            Operation::ExtractAudio => OperationKind::ExtractAudio,
            Operation::CreateGif(_) => OperationKind::CreateGif,
            Operation::CreateWebm(_) => OperationKind::CreateWebm,
        }
    }

    /// Reads the operation identifier and its parameters from request
    /// metadata, filling in defaults for absent parameters.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, DispatchError> {
        let kind: OperationKind = match metadata.get(PROCESS_TYPE) {
            None | Some(Value::Null) => return Err(DispatchError::MissingOperation),
            Some(Value::String(s)) if s.is_empty() => return Err(DispatchError::MissingOperation),
            Some(Value::String(s)) => s.parse()?,
            Some(other) => return Err(DispatchError::UnknownOperation(other.to_string())),
        };
        kind.parse(metadata)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for AspectRatio {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DispatchError::InvalidParameters {
            name: ASPECT_RATIO,
            reason: format!("expected 'W:H' with positive integers, got '{s}'"),
        };

        let (width, height) = s.split_once(':').ok_or_else(invalid)?;
        let width: u32 = width.trim().parse().map_err(|_| invalid())?;
        let height: u32 = height.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

/// Section of the input to turn into an animation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    pub start_time: String,
    pub duration: String,
}

impl Clip {
    pub fn new(start_time: impl Into<String>, duration: impl Into<String>) -> Self {
        Self {
            start_time: start_time.into(),
            duration: duration.into(),
        }
    }
}

fn dimension(metadata: &Metadata, name: &'static str, default: u32) -> Result<u32, DispatchError> {
    let Some(value) = metadata.get(name) else {
        return Ok(default);
    };

    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| DispatchError::InvalidParameters {
            name,
            reason: format!("expected a positive integer, got {value}"),
        })
}

fn text<'a>(
    metadata: &'a Metadata,
    name: &'static str,
    default: &'a str,
) -> Result<&'a str, DispatchError> {
    match metadata.get(name) {
        None => Ok(default),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(DispatchError::InvalidParameters {
            name,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

fn timestamp<'a>(
    metadata: &'a Metadata,
    name: &'static str,
    default: &'a str,
) -> Result<&'a str, DispatchError> {
    let value = text(metadata, name, default)?;
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || c == ':' || c == '.');

    if !valid {
        return Err(DispatchError::InvalidParameters {
            name,
            reason: format!("expected a timestamp such as '00:00:10', got '{value}'"),
        });
    }
    Ok(value)
}

fn clip(metadata: &Metadata) -> Result<Clip, DispatchError> {
    Ok(Clip::new(
        timestamp(metadata, START_TIME, DEFAULT_START_TIME)?,
        timestamp(metadata, DURATION, DEFAULT_DURATION)?,
    ))
}

/// Processed output ready to be sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub media_type: String,
    pub size: u64,
}

/// Routes decoded requests to a [`Processor`].
#[derive(Clone)]
pub struct Dispatcher {
    processor: Arc<dyn Processor>,
}

impl Dispatcher {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }

    /// Runs the operation named in `metadata` against the staged input. Any
    /// output the processor reports is registered with `staged` before it is
    /// inspected, so it is removed together with the input.
    pub fn dispatch(
        &self,
        metadata: &Metadata,
        staged: &mut StagedFiles,
    ) -> Result<Artifact, DispatchError> {
        let operation = Operation::from_metadata(metadata)?;
        info!(
            "dispatching '{}' for {:?}",
            operation.kind().identifier(),
            staged.input()
        );

        let input = staged.input().to_path_buf();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.processor.process(&input, &operation)
        }));

        let path = match result {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                warn!("'{}' failed: {e}", operation.kind().identifier());
                return Err(DispatchError::ProcessingFailed(e.to_string()));
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("processor panicked: {message}");
                return Err(DispatchError::ProcessingFailed(format!(
                    "processor panicked: {message}"
                )));
            }
        };
        staged.track(path.clone());

        let size = fs::metadata(&path)
            .map_err(|e| DispatchError::ProcessingFailed(format!("output unreadable: {e}")))?
            .len();
        if size == 0 {
            return Err(DispatchError::ProcessingFailed(
                "processor produced an empty output".into(),
            ));
        }
        if size > MAX_PAYLOAD_SIZE {
            return Err(DispatchError::ProcessingFailed(format!(
                "output of {size} bytes does not fit in a response"
            )));
        }

        let media_type = artifact_media_type(&path, operation.kind())?;

        Ok(Artifact {
            path,
            media_type,
            size,
        })
    }
}

/// Media type tag of an output file: its extension, or the operation's
/// output kind when it has none. Must fit the header's tag field.
fn artifact_media_type(path: &Path, kind: OperationKind) -> Result<String, DispatchError> {
    let media_type = path
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or(kind.output_kind());

    if media_type.len() as u64 > MAX_MEDIA_TYPE_SIZE {
        return Err(DispatchError::ProcessingFailed(format!(
            "output media type is {} bytes long",
            media_type.len()
        )));
    }
    Ok(media_type.to_string())
}
