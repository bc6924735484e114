//! Framing: transport prefix, 4-byte checksum, context byte, optional ids,
//! NUL-terminated strings and a binary tail.
//!
//! ```text
//! prefix | checksum | context | [service_id] | [conversation_id] | [strings_len] | strings | binary
//! ```
//! `strings_len` is only present when a message carries both strings and binary.
//! All integers are little-endian. The checksum covers everything after itself.

use crate::checksum::{self, ChecksumKind, CHECKSUM_LEN};
use crate::protocol::{Context, MessageKind};

const CONTEXT_LEN: usize = 1;
const ID_LEN: usize = 2;

/// Offset of the context byte relative to the end of the prefix.
pub const CONTEXT_OFFSET: usize = CHECKSUM_LEN;

/// Smallest valid message after the prefix: checksum + context.
pub const MIN_MESSAGE_LEN: usize = CHECKSUM_LEN + CONTEXT_LEN;

/// A decoded (or to-be-encoded) message. Optional sections are present iff set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub kind: MessageKind,
    pub service_id: Option<u16>,
    pub conversation_id: Option<u16>,
    pub strings: Vec<String>,
    pub binary: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Plain application message carrying `data` as binary.
    pub fn binary(kind: MessageKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            binary: data.into(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service_id: u16) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_conversation(mut self, conversation_id: u16) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_strings<S: Into<String>>(mut self, strings: impl IntoIterator<Item = S>) -> Self {
        self.strings = strings.into_iter().map(Into::into).collect();
        self
    }

    /// Context byte derived from which sections are populated.
    pub fn context(&self) -> Context {
        Context {
            kind: self.kind,
            service_call: self.service_id.is_some(),
            conversation: self.conversation_id.is_some(),
            has_strings: !self.strings.is_empty(),
            has_binary: !self.binary.is_empty(),
        }
    }
}

/// Error building a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("string contains a NUL byte")]
    NulInString,
    #[error("string section exceeds 65535 bytes")]
    StringsTooLong,
}

/// Error decoding a message. Length errors are `TooShort`/`TooLong`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message too short")]
    TooShort,
    #[error("message too long")]
    TooLong,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unknown message kind in context byte {0:#04x}")]
    UnknownKind(u8),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("string is not valid UTF-8")]
    InvalidString,
}

impl DecodeError {
    /// True for the structural length errors.
    pub fn is_length_error(&self) -> bool {
        matches!(self, DecodeError::TooShort | DecodeError::TooLong)
    }
}

/// Encode a message without a prefix: checksum slot first.
pub fn encode(msg: &Message, checksum: ChecksumKind) -> Result<Vec<u8>, EncodeError> {
    encode_with_prefix(msg, 0, checksum)
}

/// Encode a message leaving `prefix_len` zeroed bytes in front for the transport.
pub fn encode_with_prefix(
    msg: &Message,
    prefix_len: usize,
    checksum: ChecksumKind,
) -> Result<Vec<u8>, EncodeError> {
    let ctx = msg.context();
    let mut strings = Vec::new();
    for s in &msg.strings {
        if s.as_bytes().contains(&0) {
            return Err(EncodeError::NulInString);
        }
        strings.extend_from_slice(s.as_bytes());
        strings.push(0);
    }

    let mut out = Vec::with_capacity(
        prefix_len + MIN_MESSAGE_LEN + 3 * ID_LEN + strings.len() + msg.binary.len(),
    );
    out.resize(prefix_len + CHECKSUM_LEN, 0);
    out.push(ctx.to_byte());
    if let Some(id) = msg.service_id {
        out.extend_from_slice(&id.to_le_bytes());
    }
    if let Some(id) = msg.conversation_id {
        out.extend_from_slice(&id.to_le_bytes());
    }
    if ctx.has_strings && ctx.has_binary {
        let len = u16::try_from(strings.len()).map_err(|_| EncodeError::StringsTooLong)?;
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.extend_from_slice(&strings);
    out.extend_from_slice(&msg.binary);

    let slot = checksum::compute(checksum, &out[prefix_len + CHECKSUM_LEN..]);
    out[prefix_len..prefix_len + CHECKSUM_LEN].copy_from_slice(&slot);
    Ok(out)
}

/// Decode a message, skipping `prefix_len` transport bytes.
pub fn decode(bytes: &[u8], prefix_len: usize) -> Result<Message, DecodeError> {
    if bytes.len() < prefix_len + MIN_MESSAGE_LEN {
        return Err(DecodeError::TooShort);
    }
    let body = &bytes[prefix_len..];
    let slot = [body[0], body[1], body[2], body[3]];
    let covered = &body[CHECKSUM_LEN..];
    if !checksum::verify(&slot, covered) {
        return Err(DecodeError::ChecksumMismatch);
    }

    let ctx = Context::from_byte(covered[0]).ok_or(DecodeError::UnknownKind(covered[0]))?;
    let mut pos = CONTEXT_LEN;
    let mut msg = Message::new(ctx.kind);

    if ctx.service_call {
        msg.service_id = Some(read_u16(covered, &mut pos)?);
    }
    if ctx.conversation {
        msg.conversation_id = Some(read_u16(covered, &mut pos)?);
    }

    let strings_end = match (ctx.has_strings, ctx.has_binary) {
        (true, true) => {
            let len = read_u16(covered, &mut pos)? as usize;
            if pos + len > covered.len() {
                return Err(DecodeError::TooShort);
            }
            pos + len
        }
        (true, false) => covered.len(),
        _ => pos,
    };
    if ctx.has_strings {
        msg.strings = parse_strings(&covered[pos..strings_end])?;
    }
    pos = strings_end;

    let tail = &covered[pos..];
    if ctx.has_binary {
        if tail.is_empty() {
            return Err(DecodeError::Malformed("binary flag set without binary data"));
        }
        msg.binary = tail.to_vec();
    } else if !tail.is_empty() {
        return Err(DecodeError::TooLong);
    }
    Ok(msg)
}

fn read_u16(data: &[u8], pos: &mut usize) -> Result<u16, DecodeError> {
    let end = *pos + ID_LEN;
    if end > data.len() {
        return Err(DecodeError::TooShort);
    }
    let v = u16::from_le_bytes([data[*pos], data[*pos + 1]]);
    *pos = end;
    Ok(v)
}

fn parse_strings(region: &[u8]) -> Result<Vec<String>, DecodeError> {
    // An unterminated section means the buffer was cut short.
    let Some((&0, body)) = region.split_last() else {
        return Err(DecodeError::TooShort);
    };
    body.split(|&b| b == 0)
        .map(|s| String::from_utf8(s.to_vec()).map_err(|_| DecodeError::InvalidString))
        .collect()
}
