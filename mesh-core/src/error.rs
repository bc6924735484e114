//! Crate-level error taxonomy.

use crate::fragment::FragmentError;
use crate::transport::{LinkError, TransportKind};
use crate::wire::{DecodeError, EncodeError};

/// Error returned by network operations. Clone so one outcome can be handed to
/// whoever waits on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("fragmentation error: {0}")]
    Fragment(#[from] FragmentError),
    #[error("peer not found")]
    PeerNotFound,
    #[error("peer already exists")]
    PeerExists,
    #[error("peer is banned")]
    PeerBanned,
    #[error("peer is already presenting")]
    AlreadyPresenting,
    #[error("no suitable transport")]
    NoSuitableTransport,
    #[error("transport {0} not supported")]
    UnsupportedTransport(TransportKind),
    #[error("timed out")]
    Timeout,
    #[error("send queue full")]
    QueueFull,
    #[error("relation table full")]
    TooManyRelations,
    #[error("relation store: {0}")]
    Store(String),
    #[error("invalid service id {0}")]
    InvalidServiceId(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("message too long")]
    MessageTooLong,
    #[error("transport is recovering")]
    Recovering,
    #[error("network is shut down")]
    ShutDown,
    #[error("could not start thread: {0}")]
    Thread(String),
}

impl NetError {
    /// The peer answered that it does not know us.
    pub fn is_who(&self) -> bool {
        matches!(self, NetError::Link(LinkError::Who))
    }
}
