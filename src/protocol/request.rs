use serde_json::json;

use crate::operation::Operation;

use super::message::Metadata;

/// Reserved metadata key naming the operation to run.
pub const PROCESS_TYPE: &str = "process_type";
pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";
pub const ASPECT_RATIO: &str = "aspect_ratio";
pub const START_TIME: &str = "start_time";
pub const DURATION: &str = "duration";

/// A processing request as built by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub operation: Operation,
    pub media_type: String,
}

impl Request {
    pub fn new(operation: Operation, media_type: impl Into<String>) -> Self {
        Self {
            operation,
            media_type: media_type.into(),
        }
    }

    pub fn metadata(&self) -> Metadata {
        let mut out = Metadata::new();
        out.insert(
            PROCESS_TYPE.into(),
            json!(self.operation.kind().identifier()),
        );

        match &self.operation {
            Operation::Compress | Operation::ExtractAudio => {}
            Operation::ResizeResolution { width, height } => {
                out.insert(WIDTH.into(), json!(width));
                out.insert(HEIGHT.into(), json!(height));
            }
            Operation::ChangeAspectRatio { aspect_ratio } => {
                out.insert(ASPECT_RATIO.into(), json!(aspect_ratio.to_string()));
            }
            Operation::CreateGif(clip) | Operation::CreateWebm(clip) => {
                out.insert(START_TIME.into(), json!(clip.start_time));
                out.insert(DURATION.into(), json!(clip.duration));
            }
        }
        out
    }
}
