pub mod admission;
pub mod command;
pub mod config;
pub mod operation;
pub mod processor;
pub mod protocol;
pub mod staging;

pub use command::{Action, ActionArgs, CommandError};
pub use config::{ClientConfig, ServerConfig};
pub use operation::{Dispatcher, Operation, OperationKind};
pub use processor::{FfmpegProcessor, Processor};
pub use protocol::{MediaClient, MediaServer};
