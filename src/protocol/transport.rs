//! Exact-length reads and writes over a byte stream.
//!
//! [`ProtocolTransport`] is the only place bytes cross the network boundary.
//! Sockets may hand back any prefix of what was asked for, so every primitive
//! here loops until the requested count has been moved, the peer goes away, or
//! the stream's idle timeout fires.
use std::io::{self, ErrorKind, Read, Write};

use log::trace;

use super::{
    ProtocolError,
    header::{HEADER_SIZE, Header},
};

/// Upper bound on a single read or write when streaming a payload.
pub const CHUNK_SIZE: usize = 64 * 1024;

pub struct ProtocolTransport<T> {
    stream: T,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: Read> ProtocolTransport<T> {
    /// Reads exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0; n];
        self.read_exact_into(&mut buf)?;
        Ok(buf)
    }

    pub fn read_exact_into(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        if self.fill(buf)? < buf.len() {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    /// Reads the fixed header. A peer that closes before sending anything is
    /// reported as [`ProtocolError::ConnectionClosed`], one that stops part way
    /// as [`ProtocolError::MalformedHeader`].
    pub fn read_header(&mut self) -> Result<Header, ProtocolError> {
        let mut buf = [0; HEADER_SIZE];
        match self.fill(&mut buf)? {
            0 => Err(ProtocolError::ConnectionClosed),
            n if n < HEADER_SIZE => Err(ProtocolError::MalformedHeader {
                received: n,
                expected: HEADER_SIZE,
            }),
            _ => Header::from_bytes(&buf),
        }
    }

    /// Moves exactly `len` bytes from the stream into `sink`, at most
    /// [`CHUNK_SIZE`] at a time.
    pub fn copy_exact<W: Write>(&mut self, len: u64, sink: &mut W) -> Result<u64, ProtocolError> {
        let mut chunk = vec![0; len.min(CHUNK_SIZE as u64) as usize];
        let mut remaining = len;

        while remaining > 0 {
            let want = next_chunk(chunk.len(), remaining);
            self.read_exact_into(&mut chunk[..want])?;
            sink.write_all(&chunk[..want])?;
            remaining -= want as u64;
        }
        sink.flush()?;

        trace!("copied {len} payload bytes");
        Ok(len)
    }

    /// Reads until `buf` is full or the peer closes, returning how many bytes
    /// arrived.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(stream_error(e)),
            }
        }
        Ok(filled)
    }
}

impl<T: Write> ProtocolTransport<T> {
    pub fn write_all(&mut self, mut bytes: &[u8]) -> Result<(), ProtocolError> {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(ProtocolError::ConnectionClosed),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(stream_error(e)),
            }
        }
        Ok(())
    }

    /// Streams exactly `len` bytes from `source` onto the connection.
    pub fn copy_from<R: Read>(&mut self, len: u64, source: &mut R) -> Result<(), ProtocolError> {
        let mut chunk = vec![0; len.min(CHUNK_SIZE as u64) as usize];
        let mut remaining = len;

        while remaining > 0 {
            let want = next_chunk(chunk.len(), remaining);
            source.read_exact(&mut chunk[..want])?;
            self.write_all(&chunk[..want])?;
            remaining -= want as u64;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        self.stream.flush().map_err(stream_error)
    }
}

/// Bytes to move next: a full chunk, or what is left if that is less.
fn next_chunk(chunk: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(chunk, |r| r.min(chunk))
}

fn stream_error(e: io::Error) -> ProtocolError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => ProtocolError::Timeout,
        _ => ProtocolError::ConnectionClosed,
    }
}
