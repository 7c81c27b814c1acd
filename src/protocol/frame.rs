use super::{MessageType, ProtocolVariant};
use crate::error::Error;
use tracing::trace;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 16;

/// Fixed frame header.
///
/// Wire format: \[version\]\[total_length\]\[message_type\]\[tag\], each a
/// little-endian `u32`. `total_length` includes the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub length: u32,
    pub message: u32,
    pub tag: u32,
}

impl Header {
    /// Reads a header from the start of `buf`, or `None` if it is incomplete.
    pub fn parse(buf: &[u8]) -> Option<Header> {
        let word = |i: usize| -> Option<u32> {
            let bytes: [u8; 4] = buf.get(i * 4..i * 4 + 4)?.try_into().ok()?;
            Some(u32::from_le_bytes(bytes))
        };
        Some(Header {
            version: word(0)?,
            length: word(1)?,
            message: word(2)?,
            tag: word(3)?,
        })
    }

    /// Checks the announced length against the header size and the
    /// receive capacity of the connection.
    pub fn validate(&self, capacity: usize) -> Result<(), Error> {
        if (self.length as usize) < HEADER_SIZE {
            return Err(Error::FrameTooShort {
                length: self.length,
            });
        }
        if self.length as usize > capacity {
            return Err(Error::FrameTooLarge {
                length: self.length,
                capacity,
            });
        }
        Ok(())
    }

    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..12].copy_from_slice(&self.message.to_le_bytes());
        out[12..16].copy_from_slice(&self.tag.to_le_bytes());
        out
    }
}

/// A complete frame: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(variant: ProtocolVariant, message: MessageType, tag: u32, payload: Vec<u8>) -> Self {
        Self {
            version: variant.header_version(),
            message: message as u32,
            tag,
            payload,
        }
    }

    pub fn header(&self) -> Header {
        Header {
            version: self.version,
            length: (HEADER_SIZE + self.payload.len()) as u32,
            message: self.message,
            tag: self.tag,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.header().to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes one frame from the front of a stream buffer.
    ///
    /// Returns:
    /// - `Ok(Some((frame, bytes_read)))` - a complete frame
    /// - `Ok(None)` - not enough data yet
    /// - `Err(_)` - the header announces an invalid length
    pub fn decode(buf: &[u8], capacity: usize) -> Result<Option<(Frame, usize)>, Error> {
        let Some(header) = Header::parse(buf) else {
            return Ok(None);
        };
        header.validate(capacity)?;
        let total = header.length as usize;
        if buf.len() < total {
            return Ok(None);
        }
        trace!(len = total, message = header.message, tag = header.tag, "Decoded frame");
        Ok(Some((
            Frame {
                version: header.version,
                message: header.message,
                tag: header.tag,
                payload: buf[HEADER_SIZE..total].to_vec(),
            },
            total,
        )))
    }
}
