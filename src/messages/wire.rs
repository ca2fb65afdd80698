//! Encoding and decoding of SSH Relay messages.
//!
//! Every message starts with a big-endian 2-byte tag. Layouts:
//!
//! ```text
//! CONNECT_SUCCESS_SID    tag(2) | length(4) | sid(length, ASCII)
//! RECONNECT_SUCCESS_ACK  tag(2) | ack(8)
//! DATA                   tag(2) | length(4) | payload(length)
//! ACK                    tag(2) | ack(8)
//! LONG_CLOSE             tag(2) | code(4) | length(4) | reason(length, UTF-8)
//! ```
//!
//! Decoders return the decoded value together with the number of bytes they
//! consumed so callers can detect short reads and trailing garbage.

use crate::messages::types::MessageTag;
use thiserror::Error;
use tracing::trace;

// Wire protocol constants
pub const MAX_ARRAY_LENGTH: usize = 16 * 1024;
pub const TAG_LENGTH: usize = 2;
pub const ARRAY_LENGTH_SIZE: usize = 4;
pub const ACK_VALUE_SIZE: usize = 8;

pub const DATA_HEADER_LENGTH: usize = TAG_LENGTH + ARRAY_LENGTH_SIZE;
pub const MAX_DATA_PAYLOAD_LENGTH: usize = MAX_ARRAY_LENGTH;
pub const ACK_MESSAGE_LENGTH: usize = TAG_LENGTH + ACK_VALUE_SIZE;
pub const LONG_CLOSE_MIN_LENGTH: usize = TAG_LENGTH + 4 + ARRAY_LENGTH_SIZE;

// DATA messages are the largest.
pub const MAX_MESSAGE_SIZE: usize = DATA_HEADER_LENGTH + MAX_DATA_PAYLOAD_LENGTH;

/// Custom error types for wire protocol operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireProtocolError {
    #[error("Message is truncated: {required} bytes required, {actual} bytes available")]
    Truncated { required: usize, actual: usize },

    #[error("Buffer too small: {required} bytes required, {actual} bytes available")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("Invalid array length: {length} (must be between 1 and {max})")]
    InvalidLength { length: usize, max: usize },

    #[error("Read buffer too small: payload of {length} bytes does not fit into {capacity} bytes")]
    TargetTooSmall { length: usize, capacity: usize },

    #[error("Unexpected message tag: expected {expected}, found {actual}")]
    UnexpectedTag {
        expected: MessageTag,
        actual: MessageTag,
    },

    #[error("Session id must be a non-empty ASCII string")]
    InvalidSid,

    #[error("Close reason is not valid UTF-8")]
    InvalidReason,
}

pub type Result<T> = std::result::Result<T, WireProtocolError>;

/// A decoded LONG_CLOSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongClose {
    pub code: u32,
    pub reason: String,
}

fn ensure_readable(message: &[u8], required: usize) -> Result<()> {
    if message.len() < required {
        return Err(WireProtocolError::Truncated {
            required,
            actual: message.len(),
        });
    }
    Ok(())
}

fn ensure_writable(buffer: &[u8], required: usize) -> Result<()> {
    if buffer.len() < required {
        return Err(WireProtocolError::BufferTooSmall {
            required,
            actual: buffer.len(),
        });
    }
    Ok(())
}

fn read_u16(message: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([message[offset], message[offset + 1]])
}

fn read_u32(message: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&message[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn read_u64(message: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&message[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

fn expect_tag(message: &[u8], expected: MessageTag) -> Result<()> {
    let actual = MessageTag::from_u16(read_u16(message, 0));
    if actual != expected {
        return Err(WireProtocolError::UnexpectedTag { expected, actual });
    }
    Ok(())
}

fn validate_array_length(length: usize) -> Result<usize> {
    if length == 0 || length > MAX_ARRAY_LENGTH {
        return Err(WireProtocolError::InvalidLength {
            length,
            max: MAX_ARRAY_LENGTH,
        });
    }
    Ok(length)
}

// Tag

pub fn encode_tag(buffer: &mut [u8], tag: MessageTag) -> Result<usize> {
    ensure_writable(buffer, TAG_LENGTH)?;
    buffer[..TAG_LENGTH].copy_from_slice(&tag.as_u16().to_be_bytes());
    Ok(TAG_LENGTH)
}

/// Decode the tag of a message. Unknown tags decode successfully.
pub fn decode_tag(message: &[u8]) -> Result<(MessageTag, usize)> {
    ensure_readable(message, TAG_LENGTH)?;
    Ok((MessageTag::from_u16(read_u16(message, 0)), TAG_LENGTH))
}

// CONNECT_SUCCESS_SID

pub fn encode_connect_success_sid(buffer: &mut [u8], sid: &str) -> Result<usize> {
    if sid.is_empty() || !sid.is_ascii() {
        return Err(WireProtocolError::InvalidSid);
    }
    let length = validate_array_length(sid.len())?;
    let required = DATA_HEADER_LENGTH + length;
    ensure_writable(buffer, required)?;

    encode_tag(buffer, MessageTag::ConnectSuccessSid)?;
    buffer[2..6].copy_from_slice(&(length as u32).to_be_bytes());
    buffer[6..required].copy_from_slice(sid.as_bytes());
    Ok(required)
}

pub fn decode_connect_success_sid(message: &[u8]) -> Result<(String, usize)> {
    ensure_readable(message, DATA_HEADER_LENGTH)?;
    expect_tag(message, MessageTag::ConnectSuccessSid)?;

    let length = validate_array_length(read_u32(message, 2) as usize)?;
    ensure_readable(message, DATA_HEADER_LENGTH + length)?;

    let sid_bytes = &message[DATA_HEADER_LENGTH..DATA_HEADER_LENGTH + length];
    if !sid_bytes.is_ascii() {
        return Err(WireProtocolError::InvalidSid);
    }
    let sid = String::from_utf8_lossy(sid_bytes).into_owned();
    Ok((sid, DATA_HEADER_LENGTH + length))
}

// RECONNECT_SUCCESS_ACK and ACK share a layout.

fn encode_ack_like(buffer: &mut [u8], tag: MessageTag, ack: u64) -> Result<usize> {
    ensure_writable(buffer, ACK_MESSAGE_LENGTH)?;
    encode_tag(buffer, tag)?;
    buffer[2..ACK_MESSAGE_LENGTH].copy_from_slice(&ack.to_be_bytes());
    Ok(ACK_MESSAGE_LENGTH)
}

fn decode_ack_like(message: &[u8], tag: MessageTag) -> Result<(u64, usize)> {
    ensure_readable(message, ACK_MESSAGE_LENGTH)?;
    expect_tag(message, tag)?;
    Ok((read_u64(message, 2), ACK_MESSAGE_LENGTH))
}

pub fn encode_reconnect_ack(buffer: &mut [u8], ack: u64) -> Result<usize> {
    encode_ack_like(buffer, MessageTag::ReconnectSuccessAck, ack)
}

pub fn decode_reconnect_ack(message: &[u8]) -> Result<(u64, usize)> {
    decode_ack_like(message, MessageTag::ReconnectSuccessAck)
}

pub fn encode_ack(buffer: &mut [u8], ack: u64) -> Result<usize> {
    encode_ack_like(buffer, MessageTag::Ack, ack)
}

pub fn decode_ack(message: &[u8]) -> Result<(u64, usize)> {
    decode_ack_like(message, MessageTag::Ack)
}

/// Allocate and encode an ACK message
pub fn ack_message(ack: u64) -> Vec<u8> {
    let mut message = vec![0u8; ACK_MESSAGE_LENGTH];
    message[..TAG_LENGTH].copy_from_slice(&MessageTag::Ack.as_u16().to_be_bytes());
    message[TAG_LENGTH..].copy_from_slice(&ack.to_be_bytes());
    message
}

// DATA

/// Encode a DATA message. The payload length is validated before the
/// buffer is touched.
pub fn encode_data(buffer: &mut [u8], payload: &[u8]) -> Result<usize> {
    let length = validate_array_length(payload.len())?;
    let required = DATA_HEADER_LENGTH + length;
    ensure_writable(buffer, required)?;

    encode_tag(buffer, MessageTag::Data)?;
    buffer[2..6].copy_from_slice(&(length as u32).to_be_bytes());
    buffer[6..required].copy_from_slice(payload);

    trace!(payload_length = length, "Encoded DATA message");
    Ok(required)
}

/// Decode a DATA message directly into `target`.
///
/// Returns the payload length and the number of message bytes consumed. A
/// payload that does not fit into `target` is an error, never truncated.
pub fn decode_data(message: &[u8], target: &mut [u8]) -> Result<(usize, usize)> {
    ensure_readable(message, DATA_HEADER_LENGTH)?;
    expect_tag(message, MessageTag::Data)?;

    let length = validate_array_length(read_u32(message, 2) as usize)?;
    ensure_readable(message, DATA_HEADER_LENGTH + length)?;

    if length > target.len() {
        return Err(WireProtocolError::TargetTooSmall {
            length,
            capacity: target.len(),
        });
    }

    target[..length].copy_from_slice(&message[DATA_HEADER_LENGTH..DATA_HEADER_LENGTH + length]);
    Ok((length, DATA_HEADER_LENGTH + length))
}

/// Allocate and encode a DATA message
pub fn data_message(payload: &[u8]) -> Result<Vec<u8>> {
    validate_array_length(payload.len())?;
    let mut message = vec![0u8; DATA_HEADER_LENGTH + payload.len()];
    encode_data(&mut message, payload)?;
    Ok(message)
}

// LONG_CLOSE

pub fn encode_long_close(buffer: &mut [u8], code: u32, reason: &str) -> Result<usize> {
    if reason.len() > MAX_ARRAY_LENGTH {
        return Err(WireProtocolError::InvalidLength {
            length: reason.len(),
            max: MAX_ARRAY_LENGTH,
        });
    }
    let required = LONG_CLOSE_MIN_LENGTH + reason.len();
    ensure_writable(buffer, required)?;

    encode_tag(buffer, MessageTag::LongClose)?;
    buffer[2..6].copy_from_slice(&code.to_be_bytes());
    buffer[6..10].copy_from_slice(&(reason.len() as u32).to_be_bytes());
    buffer[10..required].copy_from_slice(reason.as_bytes());
    Ok(required)
}

pub fn decode_long_close(message: &[u8]) -> Result<(LongClose, usize)> {
    ensure_readable(message, LONG_CLOSE_MIN_LENGTH)?;
    expect_tag(message, MessageTag::LongClose)?;

    let code = read_u32(message, 2);
    let length = read_u32(message, 6) as usize;
    if length > MAX_ARRAY_LENGTH {
        return Err(WireProtocolError::InvalidLength {
            length,
            max: MAX_ARRAY_LENGTH,
        });
    }
    ensure_readable(message, LONG_CLOSE_MIN_LENGTH + length)?;

    let reason = std::str::from_utf8(&message[LONG_CLOSE_MIN_LENGTH..LONG_CLOSE_MIN_LENGTH + length])
        .map_err(|_| WireProtocolError::InvalidReason)?
        .to_string();

    Ok((LongClose { code, reason }, LONG_CLOSE_MIN_LENGTH + length))
}
