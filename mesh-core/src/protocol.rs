//! Protocol constants: context byte, message kinds, network requests.

/// Current protocol version. Sent in every presentation.
pub const PROTOCOL_VERSION: u8 = 0;
/// Oldest protocol version this implementation talks to.
pub const PROTOCOL_VERSION_MIN: u8 = 0;

/// Peer names are at most this many bytes on the wire, including the terminator.
pub const PEER_NAME_LEN: usize = 16;

const KIND_MASK: u8 = 0b0000_0111;
const FLAG_SERVICE_CALL: u8 = 1 << 3;
const FLAG_CONVERSATION: u8 = 1 << 4;
const FLAG_STRINGS: u8 = 1 << 5;
const FLAG_BINARY: u8 = 1 << 6;

/// Message kind, stored in the low three bits of the context byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageKind {
    #[default]
    Message = 0,
    Stream = 1,
    Network = 2,
    Heartbeat = 3,
    Fragmented = 4,
}

impl MessageKind {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & KIND_MASK {
            0 => Some(MessageKind::Message),
            1 => Some(MessageKind::Stream),
            2 => Some(MessageKind::Network),
            3 => Some(MessageKind::Heartbeat),
            4 => Some(MessageKind::Fragmented),
            _ => None,
        }
    }
}

/// Decoded context byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    pub kind: MessageKind,
    pub service_call: bool,
    pub conversation: bool,
    pub has_strings: bool,
    pub has_binary: bool,
}

impl Context {
    pub fn to_byte(self) -> u8 {
        let mut b = self.kind as u8;
        if self.service_call {
            b |= FLAG_SERVICE_CALL;
        }
        if self.conversation {
            b |= FLAG_CONVERSATION;
        }
        if self.has_strings {
            b |= FLAG_STRINGS;
        }
        if self.has_binary {
            b |= FLAG_BINARY;
        }
        b
    }

    /// Returns None for reserved kinds (5-7).
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(Self {
            kind: MessageKind::from_bits(b)?,
            service_call: b & FLAG_SERVICE_CALL != 0,
            conversation: b & FLAG_CONVERSATION != 0,
            has_strings: b & FLAG_STRINGS != 0,
            has_binary: b & FLAG_BINARY != 0,
        })
    }
}

/// First byte of a network-control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkRequest {
    /// Initial presentation.
    Hi = 0x00,
    /// Presentation sent in reply to a HI.
    Hir = 0x01,
}

impl TryFrom<u8> for NetworkRequest {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x00 => Ok(NetworkRequest::Hi),
            0x01 => Ok(NetworkRequest::Hir),
            other => Err(other),
        }
    }
}

/// Why a node presents itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PresentationReason {
    Add = 0,
    Wake = 1,
    Reboot = 2,
    Recover = 3,
    Update = 4,
    Reply = 5,
}

impl TryFrom<u8> for PresentationReason {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(PresentationReason::Add),
            1 => Ok(PresentationReason::Wake),
            2 => Ok(PresentationReason::Reboot),
            3 => Ok(PresentationReason::Recover),
            4 => Ok(PresentationReason::Update),
            5 => Ok(PresentationReason::Reply),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_context_byte() {
        let ctx = Context {
            kind: MessageKind::Heartbeat,
            has_binary: true,
            ..Default::default()
        };
        assert_eq!(ctx.to_byte(), 0x43);
        assert_eq!(Context::from_byte(0x43), Some(ctx));
    }

    #[test]
    fn all_flags_survive_byte_form() {
        let ctx = Context {
            kind: MessageKind::Fragmented,
            service_call: true,
            conversation: true,
            has_strings: true,
            has_binary: true,
        };
        assert_eq!(Context::from_byte(ctx.to_byte()), Some(ctx));
    }

    #[test]
    fn reserved_kinds_rejected() {
        for b in 5..8u8 {
            assert!(Context::from_byte(b).is_none());
        }
    }

    #[test]
    fn unknown_request_code() {
        assert_eq!(NetworkRequest::try_from(0x01), Ok(NetworkRequest::Hir));
        assert_eq!(NetworkRequest::try_from(0x02), Err(0x02));
    }
}
