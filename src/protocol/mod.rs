//! Client-server communication protocol.
//!
//! This module defines the Media Message Protocol used between clients and
//! the processing server: the wire framing, the metadata contracts for
//! requests and responses, and both ends of a connection.
//!
//! # Overview
//!
//! A client opens a TCP connection, sends exactly one request message
//! carrying a media file and a processing directive, and receives exactly one
//! response message carrying either the processed file or a structured error.
//! The server closes the connection after replying.
//!
//! # Binary Format
//!
//! Every message is laid out as:
//!
//! - An 8-byte [`Header`] holding the metadata size (16 bits), media type
//!   size (8 bits) and payload size (40 bits), all big-endian.
//! - The metadata block, a UTF-8 JSON object.
//! - The media type tag (e.g. `mp4`), immediately after the metadata with no
//!   delimiter.
//! - The raw payload.
//!
//! Reads and writes go through [`ProtocolTransport`], which tolerates any
//! fragmentation of the underlying stream.
//!
//! # Key Components
//!
//! - [`Message`]: One request or response unit.
//! - [`ProtocolTransport`]: Exact-length reads and writes over a byte stream.
//! - [`MediaServer`]: Accepts connections and runs one handler per connection.
//! - [`MediaClient`]: Submits a file and collects the processed result.
//!
//! # See Also
//!
//! - [`operation`](crate::operation): Operations a request can name.
//! - [`admission`](crate::admission): Per-client limits enforced by the server.
mod client;
mod error;
pub mod header;
mod message;
pub mod request;
pub mod response;
mod server;
pub(crate) mod thread;
mod transport;

use thread::ConnectionThreads;

pub use client::{ClientError, MediaClient, output_path};
pub use error::ProtocolError;
pub use header::{HEADER_SIZE, Header};
pub use message::{Envelope, Message, Metadata};
pub use request::Request;
pub use response::{ErrorCode, ErrorRecord, Response};
pub use server::{ConnectionState, HandlerError, MediaServer, ServerError, ShutdownHandle};
pub use transport::{CHUNK_SIZE, ProtocolTransport};
