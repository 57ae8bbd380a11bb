//! Message framing on top of [`ProtocolTransport`].
//!
//! A message is a header, then the JSON metadata block immediately followed by
//! the media type tag (no delimiter between them), then the raw payload. The
//! boundary between metadata and tag is only recoverable from the header, so
//! both directions go through [`encode_body`] and [`decode_body`].
use std::io::{Read, Write};

use log::debug;
use serde_json::{Map, Value};

use super::{
    ProtocolError,
    header::{HEADER_SIZE, Header},
    transport::ProtocolTransport,
};

/// Structured fields carried by every message.
pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub metadata: Metadata,
    pub media_type: String,
    pub payload: Vec<u8>,
}

/// Everything of a message except the payload, which the caller streams
/// separately.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub metadata: Metadata,
    pub media_type: String,
    pub payload_size: u64,
}

impl Message {
    pub fn new(metadata: Metadata, media_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            metadata,
            media_type: media_type.into(),
            payload,
        }
    }

    /// Splits the message into its three wire blocks.
    pub fn encode(&self) -> Result<([u8; HEADER_SIZE], Vec<u8>, &[u8]), ProtocolError> {
        let (header, body) =
            encode_body(&self.metadata, &self.media_type, self.payload.len() as u64)?;
        Ok((header.to_bytes(), body, &self.payload))
    }

    pub fn decode(
        header: &[u8],
        body: &[u8],
        payload: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        let header = Header::from_bytes(header)?;
        if body.len() != header.body_size() {
            return Err(ProtocolError::MalformedMetadata(format!(
                "body is {} bytes, header declares {}",
                body.len(),
                header.body_size()
            )));
        }
        if payload.len() as u64 != header.payload_size() {
            return Err(ProtocolError::MalformedMetadata(format!(
                "payload is {} bytes, header declares {}",
                payload.len(),
                header.payload_size()
            )));
        }

        let (metadata, media_type) = decode_body(&header, body)?;
        Ok(Self {
            metadata,
            media_type,
            payload,
        })
    }
}

pub fn encode_body(
    metadata: &Metadata,
    media_type: &str,
    payload_size: u64,
) -> Result<(Header, Vec<u8>), ProtocolError> {
    let mut body = serde_json::to_vec(metadata)?;
    let header = Header::new(body.len(), media_type.len(), payload_size)?;
    body.extend_from_slice(media_type.as_bytes());
    Ok((header, body))
}

pub fn decode_body(header: &Header, body: &[u8]) -> Result<(Metadata, String), ProtocolError> {
    let (metadata, media_type) = body.split_at(header.metadata_size());
    let metadata: Metadata = serde_json::from_slice(metadata)?;
    let media_type = String::from_utf8(media_type.to_vec())
        .map_err(|e| ProtocolError::MalformedMetadata(format!("media type: {e}")))?;
    Ok((metadata, media_type))
}

impl<T: Read> ProtocolTransport<T> {
    /// Reads the header, metadata and media type, leaving the payload on the
    /// stream for [`ProtocolTransport::copy_exact`].
    pub fn read_envelope(&mut self) -> Result<Envelope, ProtocolError> {
        let header = self.read_header()?;
        let body = self.read_exact(header.body_size())?;
        let (metadata, media_type) = decode_body(&header, &body)?;

        debug!(
            "read envelope: {} metadata bytes, media type '{media_type}', {} payload bytes",
            header.metadata_size(),
            header.payload_size()
        );
        Ok(Envelope {
            metadata,
            media_type,
            payload_size: header.payload_size(),
        })
    }

    /// Reads a whole message, buffering the payload in memory.
    pub fn read_message(&mut self) -> Result<Message, ProtocolError> {
        let envelope = self.read_envelope()?;
        let mut payload = Vec::new();
        self.copy_exact(envelope.payload_size, &mut payload)?;

        Ok(Message {
            metadata: envelope.metadata,
            media_type: envelope.media_type,
            payload,
        })
    }
}

impl<T: Write> ProtocolTransport<T> {
    pub fn write_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let (header, body, payload) = message.encode()?;
        self.write_all(&header)?;
        self.write_all(&body)?;
        self.write_all(payload)?;
        self.flush()
    }

    /// Writes a message whose payload is read from `source` as it is sent.
    pub fn write_streamed<R: Read>(
        &mut self,
        metadata: &Metadata,
        media_type: &str,
        payload_size: u64,
        source: &mut R,
    ) -> Result<(), ProtocolError> {
        let (header, body) = encode_body(metadata, media_type, payload_size)?;
        self.write_all(&header.to_bytes())?;
        self.write_all(&body)?;
        self.copy_from(payload_size, source)?;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, SeekFrom};

    use serde_json::json;

    use super::*;
    use crate::protocol::transport::tests::Fragmented;

    fn metadata(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn request() -> Message {
        Message::new(
            metadata(json!({"process_type": "resize_resolution", "width": 640, "height": 360})),
            "mp4",
            vec![0, 1, 2, 3, 254, 255],
        )
    }

    #[test]
    fn message_round_trip() {
        let message = request();
        let (header, body, payload) = message.encode().unwrap();

        let decoded = Message::decode(&header, &body, payload.to_vec()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn message_body_has_no_delimiter() {
        let message = Message::new(metadata(json!({"status": "success"})), "mp3", vec![]);
        let (header, body, _) = message.encode().unwrap();
        let header = Header::from_bytes(&header).unwrap();

        assert_eq!(body, br#"{"status":"success"}mp3"#);
        assert_eq!(header.metadata_size(), 20);
        assert_eq!(header.media_type_size(), 3);
        assert_eq!(header.payload_size(), 0);
    }

    #[test]
    fn message_stream_round_trip() {
        let message = request();
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));

        transport.write_message(&message).unwrap();
        let mut stream = transport.into_inner();
        stream.seek(SeekFrom::Start(0)).unwrap();

        let mut transport = ProtocolTransport::new(stream);
        assert_eq!(transport.read_message().unwrap(), message);
    }

    #[test]
    fn message_from_fragmented_stream() {
        let message = request();
        let (header, body, payload) = message.encode().unwrap();
        let stream = Fragmented::new(vec![
            header[..3].to_vec(),
            header[3..5].to_vec(),
            header[5..].to_vec(),
            body[..7].to_vec(),
            body[7..].to_vec(),
            payload[..1].to_vec(),
            payload[1..].to_vec(),
        ]);
        let mut transport = ProtocolTransport::new(stream);

        assert_eq!(transport.read_message().unwrap(), message);
    }

    #[test]
    fn message_metadata_overflow() {
        let mut fields = Metadata::new();
        fields.insert("blob".into(), Value::String("x".repeat(70_000)));
        let message = Message::new(fields, "json", vec![]);

        let err = message.encode().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FieldOverflow {
                field: "metadata",
                ..
            }
        ));
    }

    #[test]
    fn message_invalid_json() {
        let body = b"{not json}mp4";
        let header = Header::new(10, 3, 0).unwrap();
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(body);
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        let err = transport.read_message().unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMetadata(_)));
    }

    #[test]
    fn message_metadata_must_be_object() {
        let body = b"[1,2]mp4";
        let header = Header::new(5, 3, 0).unwrap();

        let err = Message::decode(&header.to_bytes(), body, vec![]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMetadata(_)));
    }

    #[test]
    fn message_payload_size_mismatch() {
        let message = request();
        let (header, body, _) = message.encode().unwrap();

        let err = Message::decode(&header, &body, vec![0]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMetadata(_)));
    }

    #[test]
    fn message_truncated_payload() {
        let message = request();
        let (header, body, payload) = message.encode().unwrap();
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&payload[..2]);
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        let err = transport.read_message().unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn message_streamed_payload() {
        let fields = metadata(json!({"status": "success"}));
        let artifact = vec![7_u8; 100_000];
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));

        transport
            .write_streamed(&fields, "gif", artifact.len() as u64, &mut artifact.as_slice())
            .unwrap();
        let mut stream = transport.into_inner();
        stream.seek(SeekFrom::Start(0)).unwrap();

        let mut transport = ProtocolTransport::new(stream);
        let envelope = transport.read_envelope().unwrap();
        assert_eq!(envelope.metadata, fields);
        assert_eq!(envelope.media_type, "gif");
        assert_eq!(envelope.payload_size, 100_000);

        let mut sink = Vec::new();
        transport
            .copy_exact(envelope.payload_size, &mut sink)
            .unwrap();
        assert_eq!(sink, artifact);
    }
}
