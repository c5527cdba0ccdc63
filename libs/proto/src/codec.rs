//! Newline-delimited JSON framing.
//!
//! Each message is one JSON object followed by `\n`. JSON string escaping
//! guarantees the delimiter never appears inside a message. Reads from a
//! pipe may return partial messages, so the receiving side accumulates bytes
//! in a `MessageBuffer` and only yields complete lines.

use crate::error::ProtoError;
use crate::message::Message;

/// Largest accepted message, in bytes (excluding the delimiter).
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

const DELIMITER: u8 = b'\n';

/// Encode a message as a single delimited line.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    let mut bytes = serde_json::to_vec(msg)?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtoError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    bytes.push(DELIMITER);
    Ok(bytes)
}

/// Receive buffer that reassembles messages from partial reads.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
    /// Bytes at the front of `buf` already scanned without finding a delimiter.
    scanned: usize,
}

impl MessageBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns true if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns true if at least one complete message is buffered.
    pub fn has_complete(&self) -> bool {
        self.buf[self.scanned..].contains(&DELIMITER)
    }

    /// Pop the next complete message.
    ///
    /// Returns `Ok(None)` when only a partial message (or nothing) is
    /// buffered. A line that fails to decode, or a partial message that has
    /// grown past `MAX_MESSAGE_BYTES`, is an error.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtoError> {
        let Some(offset) = self.buf[self.scanned..]
            .iter()
            .position(|&b| b == DELIMITER)
        else {
            self.scanned = self.buf.len();
            if self.buf.len() > MAX_MESSAGE_BYTES {
                return Err(ProtoError::MessageTooLarge {
                    size: self.buf.len(),
                    max: MAX_MESSAGE_BYTES,
                });
            }
            return Ok(None);
        };

        let end = self.scanned + offset;
        let line: Vec<u8> = self.buf.drain(..=end).collect();
        self.scanned = 0;

        let line = &line[..line.len() - 1];
        if line.iter().all(u8::is_ascii_whitespace) {
            return Err(ProtoError::MalformedMessage("empty message".to_string()));
        }

        serde_json::from_slice(line)
            .map(Some)
            .map_err(|e| ProtoError::MalformedMessage(e.to_string()))
    }
}
