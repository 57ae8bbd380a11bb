//! Fixed-size message header.
//!
//! Every message starts with eight big-endian bytes describing the sizes of
//! the three variable-length blocks that follow:
//!
//! ```text
//! 0       2    3                   8
//! +-------+----+-------------------+
//! | meta  | mt |   payload size    |
//! | u16   | u8 |   u40             |
//! +-------+----+-------------------+
//! ```
//!
//! The 16-bit metadata size bounds how much has to be buffered before the
//! structured fields can be parsed, while the 40-bit payload size covers
//! anything up to a terabyte of media.
use super::ProtocolError;

pub const HEADER_SIZE: usize = 8;

pub const MAX_METADATA_SIZE: u64 = u16::MAX as u64;
pub const MAX_MEDIA_TYPE_SIZE: u64 = u8::MAX as u64;
pub const MAX_PAYLOAD_SIZE: u64 = (1 << 40) - 1;

const METADATA_SIZE: usize = 0;
const MEDIA_TYPE_SIZE: usize = METADATA_SIZE + size_of::<u16>();
const PAYLOAD_SIZE: usize = MEDIA_TYPE_SIZE + size_of::<u8>();
const PAYLOAD_WIDTH: usize = HEADER_SIZE - PAYLOAD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    metadata_size: u16,
    media_type_size: u8,
    payload_size: u64,
}

impl Header {
    /// Builds a header, rejecting any size that does not fit its field.
    pub fn new(
        metadata_size: usize,
        media_type_size: usize,
        payload_size: u64,
    ) -> Result<Self, ProtocolError> {
        let metadata_size = check_width("metadata", metadata_size as u64, MAX_METADATA_SIZE)?;
        let media_type_size =
            check_width("media type", media_type_size as u64, MAX_MEDIA_TYPE_SIZE)?;
        let payload_size = check_width("payload", payload_size, MAX_PAYLOAD_SIZE)?;

        Ok(Self {
            metadata_size: metadata_size as u16,
            media_type_size: media_type_size as u8,
            payload_size,
        })
    }

    pub fn metadata_size(&self) -> usize {
        self.metadata_size as usize
    }

    pub fn media_type_size(&self) -> usize {
        self.media_type_size as usize
    }

    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Length of the metadata block plus the media type tag.
    pub fn body_size(&self) -> usize {
        self.metadata_size() + self.media_type_size()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0; HEADER_SIZE];

        out[METADATA_SIZE..MEDIA_TYPE_SIZE].copy_from_slice(&self.metadata_size.to_be_bytes());
        out[MEDIA_TYPE_SIZE] = self.media_type_size;
        out[PAYLOAD_SIZE..]
            .copy_from_slice(&self.payload_size.to_be_bytes()[size_of::<u64>() - PAYLOAD_WIDTH..]);

        out
    }

    /// Parses the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedHeader {
                received: bytes.len(),
                expected: HEADER_SIZE,
            });
        }

        let metadata_size = u16::from_be_bytes([bytes[METADATA_SIZE], bytes[METADATA_SIZE + 1]]);
        let media_type_size = bytes[MEDIA_TYPE_SIZE];

        let mut wide = [0; size_of::<u64>()];
        wide[size_of::<u64>() - PAYLOAD_WIDTH..].copy_from_slice(&bytes[PAYLOAD_SIZE..HEADER_SIZE]);
        let payload_size = u64::from_be_bytes(wide);

        Ok(Self {
            metadata_size,
            media_type_size,
            payload_size,
        })
    }
}

fn check_width(field: &'static str, value: u64, max: u64) -> Result<u64, ProtocolError> {
    if value > max {
        return Err(ProtocolError::FieldOverflow { field, value, max });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let header = Header::new(0x0102, 0x03, 0x04_0506_0708).unwrap();

        assert_eq!(
            header.to_bytes(),
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn header_maximum_sizes() {
        let header = Header::new(65535, 255, MAX_PAYLOAD_SIZE).unwrap();
        let bytes = header.to_bytes();

        assert_eq!(bytes, [0xff; HEADER_SIZE]);

        let decoded = Header::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.metadata_size(), 65535);
        assert_eq!(decoded.media_type_size(), 255);
        assert_eq!(decoded.payload_size(), (1 << 40) - 1);
    }

    #[test]
    fn header_metadata_overflow() {
        let err = Header::new(65536, 0, 0).unwrap_err();

        assert!(matches!(
            err,
            ProtocolError::FieldOverflow {
                field: "metadata",
                value: 65536,
                ..
            }
        ));
    }

    #[test]
    fn header_media_type_overflow() {
        let err = Header::new(0, 256, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldOverflow { field: "media type", .. }));
    }

    #[test]
    fn header_payload_overflow() {
        let err = Header::new(0, 0, 1 << 40).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldOverflow { field: "payload", .. }));
    }

    #[test]
    fn header_too_short() {
        let err = Header::from_bytes(&[0, 1, 2, 3, 4]).unwrap_err();

        assert!(matches!(
            err,
            ProtocolError::MalformedHeader {
                received: 5,
                expected: HEADER_SIZE
            }
        ));
    }
}
