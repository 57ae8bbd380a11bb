//! Media processing backends.
//!
//! The server never transforms media itself; it hands a staged input file and
//! an [`Operation`] to a [`Processor`] and sends back whatever file comes out.
//! [`FfmpegProcessor`] is the production backend and shells out to an
//! `ffmpeg` binary, one invocation per request.
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use log::debug;
use thiserror::Error;

use crate::operation::Operation;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("failed to launch '{program}': {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("processor IO error: {0}")]
    Io(#[from] io::Error),
}

/// Performs one operation on an input file, returning the path of the file it
/// produced. Implementations block for the duration of the work.
pub trait Processor: Send + Sync {
    fn process(&self, input: &Path, operation: &Operation) -> Result<PathBuf, ProcessorError>;
}

pub struct FfmpegProcessor {
    program: PathBuf,
    output_dir: PathBuf,
}

impl FfmpegProcessor {
    /// Outputs are written to `output_dir`.
    pub fn new(program: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            output_dir: output_dir.into(),
        }
    }
}

impl Processor for FfmpegProcessor {
    fn process(&self, input: &Path, operation: &Operation) -> Result<PathBuf, ProcessorError> {
        // Removed again on drop unless the run succeeds.
        let output = tempfile::Builder::new()
            .prefix("output_")
            .suffix(&format!(".{}", operation.kind().output_kind()))
            .tempfile_in(&self.output_dir)?
            .into_temp_path();

        let program = self.program.display().to_string();
        let args = arguments(input, operation, &output);
        debug!("running {program} {args:?}");

        let result = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| ProcessorError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(ProcessorError::Failed {
                program,
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        output.keep().map_err(|e| ProcessorError::Io(e.error))
    }
}

/// Command line for one operation. `-y` is required as the output path
/// already exists when ffmpeg starts.
pub fn arguments(input: &Path, operation: &Operation, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.into()];

    let rest: Vec<String> = match operation {
        Operation::Compress => vec![
            "-c:v", "libx264", "-crf", "23", "-c:a", "aac", "-b:a", "128k",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
        Operation::ResizeResolution { width, height } => vec![
            "-vf".into(),
            format!("scale={width}:{height}"),
            "-c:a".into(),
            "copy".into(),
        ],
        Operation::ChangeAspectRatio { aspect_ratio } => {
            let (w, h) = (aspect_ratio.width, aspect_ratio.height);
            vec![
                "-vf".into(),
                format!("scale=iw*min({w}/iw\\,{h}/ih):ih*min({w}/iw\\,{h}/ih)"),
                "-c:a".into(),
                "copy".into(),
            ]
        }
        Operation::ExtractAudio => vec!["-vn", "-ar", "44100", "-ac", "2", "-b:a", "192k"]
            .into_iter()
            .map(String::from)
            .collect(),
        Operation::CreateGif(clip) => vec![
            "-ss".into(),
            clip.start_time.clone(),
            "-t".into(),
            clip.duration.clone(),
            "-vf".into(),
            "fps=10,scale=320:-1:flags=lanczos".into(),
        ],
        Operation::CreateWebm(clip) => vec![
            "-ss".into(),
            clip.start_time.clone(),
            "-t".into(),
            clip.duration.clone(),
            "-c:v".into(),
            "libvpx-vp9".into(),
            "-crf".into(),
            "30".into(),
            "-b:v".into(),
            "0".into(),
        ],
    };

    args.extend(rest.into_iter().map(OsString::from));
    args.push(output.into());
    args
}
