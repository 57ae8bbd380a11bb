use std::{
    fs::{self, File},
    io,
    net::TcpStream,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    command::{CommandError, validate_input},
    config::ClientConfig,
    operation::Operation,
    protocol::{ErrorRecord, ProtocolError, ProtocolTransport, Request, Response},
    staging::file_extension,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("could not connect to {address}: {source}")]
    Connect { address: String, source: io::Error },

    #[error("client IO error: {0}")]
    Io(#[from] io::Error),

    #[error("server error {}: {} ({})", .0.error_code, .0.description, .0.solution)]
    Rejected(ErrorRecord),
}

/// Submits one file per connection and stores what comes back.
#[derive(Debug, Clone)]
pub struct MediaClient {
    config: ClientConfig,
}

impl MediaClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Sends `input` to the server for `operation` and writes the processed
    /// file next to it. Returns the path of the written file.
    pub fn submit(&self, input: &Path, operation: Operation) -> Result<PathBuf, ClientError> {
        let (extension, size) = validate_input(input)?;
        let request = Request::new(operation, extension);

        let address = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(address.as_str())
            .map_err(|source| ClientError::Connect { address, source })?;
        stream.set_read_timeout(self.config.timeout)?;
        stream.set_write_timeout(self.config.timeout)?;

        let mut transport = ProtocolTransport::new(stream);
        let mut source = File::open(input)?;
        info!(
            "sending {size} bytes of {} for '{}'",
            request.media_type,
            request.operation.kind().identifier()
        );
        transport.write_streamed(&request.metadata(), &request.media_type, size, &mut source)?;

        let envelope = transport.read_envelope()?;
        let media_type = match Response::try_from(&envelope)? {
            Response::Err(record) => return Err(ClientError::Rejected(record)),
            Response::Success { media_type } => media_type,
        };

        let output = output_path(input, &media_type);
        debug!("receiving {} bytes into {output:?}", envelope.payload_size);
        let mut sink = File::create(&output)?;
        if let Err(e) = transport.copy_exact(envelope.payload_size, &mut sink) {
            drop(sink);
            if let Err(remove) = fs::remove_file(&output) {
                warn!("could not remove partial output {output:?}: {remove}");
            }
            return Err(e.into());
        }

        info!("saved processed file to {output:?}");
        Ok(output)
    }
}

/// Where the processed version of `input` is written: alongside it, as
/// `<stem>_processed.<media type>`.
pub fn output_path(input: &Path, media_type: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());

    input.with_file_name(format!("{stem}_processed.{}", file_extension(media_type)))
}
