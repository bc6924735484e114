//! Multi-transport peer reliability layer.
//! Frames messages, introduces peers to each other, watches every
//! (peer, transport) pair and moves traffic to the best working transport.

pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod fragment;
pub mod handshake;
pub mod health;
pub mod heartbeat;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod relation;
pub mod scoring;
pub mod send;
pub mod service;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod mock;

pub use checksum::ChecksumKind;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::NetConfig;
pub use error::NetError;
pub use health::{HealthAction, HealthState, Problem, StateChange, TransportHealth};
pub use network::{HostIdentity, Network};
pub use peer::{MacAddress, Peer, PeerHandle, PeerState};
pub use protocol::{MessageKind, PresentationReason, PROTOCOL_VERSION};
pub use relation::{Relation, RelationStore, StoreError};
pub use send::SendOptions;
pub use service::{Inbound, InboundHandler, NetworkObserver, Service};
pub use transport::{Frame, LinkError, LinkSource, PeerAddress, Transport, TransportKind, TransportSet};
pub use wire::Message;
