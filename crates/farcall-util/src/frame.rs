//! Length-prefixed, checksummed frames.
//!
//! Every message on the call channel travels as a single frame: a fixed
//! header carrying the payload checksum and length, followed by the payload
//! bytes. The checksum catches a desynchronized or corrupted stream before
//! a bad length can be interpreted as a giant read.

use bytes::{BufMut, BytesMut};
use crc::Crc;
use thiserror::Error;

type HeaderCrc = u32;
type HeaderLength = u32;

static CRC: Crc<HeaderCrc> = Crc::<HeaderCrc>::new(&crc::CRC_32_ISCSI);

pub const CRC_SIZE: usize = std::mem::size_of::<HeaderCrc>();
pub const LENGTH_SIZE: usize = std::mem::size_of::<HeaderLength>();
pub const HEADER_SIZE: usize = CRC_SIZE + LENGTH_SIZE;

const CRC_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = CRC_OFFSET + CRC_SIZE;

/// Largest payload a single frame may carry. Bulk data (buffer contents)
/// never travels in frames, so this bounds control traffic only.
pub const MAX_FRAME: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The payload exceeds [`MAX_FRAME`].
    #[error("the message is too large to send over the channel")]
    TooLarge,
    /// The payload does not match the checksum in the header.
    #[error("message checksum mismatch")]
    Corrupt,
}

/// Appends a framed copy of `body` to `buffer`.
pub fn encode(body: &[u8], buffer: &mut BytesMut) -> Result<(), FrameError> {
    if body.len() > MAX_FRAME {
        return Err(FrameError::TooLarge);
    }
    buffer.reserve(HEADER_SIZE + body.len());
    buffer.put_u32_le(CRC.checksum(body));
    buffer.put_u32_le(body.len() as HeaderLength);
    buffer.extend_from_slice(body);
    Ok(())
}

/// Splits a frame header into its checksum and payload length.
pub fn decode_header(header: [u8; HEADER_SIZE]) -> Result<(u32, usize), FrameError> {
    let crc = HeaderCrc::from_le_bytes(header[CRC_OFFSET..][..CRC_SIZE].try_into().unwrap());
    let len =
        HeaderLength::from_le_bytes(header[LENGTH_OFFSET..][..LENGTH_SIZE].try_into().unwrap());
    let len = len as usize;
    if len > MAX_FRAME {
        return Err(FrameError::TooLarge);
    }
    Ok((crc, len))
}

/// Checks a received payload against the checksum from its header.
pub fn verify(crc: u32, body: &[u8]) -> Result<(), FrameError> {
    if CRC.checksum(body) == crc {
        Ok(())
    } else {
        tracing::error!("frame checksum validation failed");
        Err(FrameError::Corrupt)
    }
}
