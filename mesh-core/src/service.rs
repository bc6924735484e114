//! Application boundary: services addressed by id, a fallback inbound handler,
//! and observers of network events.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::NetError;
use crate::health::StateChange;
use crate::peer::{Peer, PeerHandle};
use crate::transport::TransportKind;
use crate::wire::Message;

/// A received application message and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub peer: PeerHandle,
    pub peer_name: String,
    pub transport: TransportKind,
    pub message: Message,
}

/// A registered service. Messages carrying its id are routed to it.
pub trait Service: Send + Sync {
    /// Non-zero id, unique per node.
    fn id(&self) -> u16;
    fn name(&self) -> &str;
    fn on_message(&self, inbound: &Inbound);
    fn shutdown(&self) {}
}

/// Receives application messages that are not service calls.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, inbound: &Inbound);
}

/// Observer of network events. Called without any network lock held.
pub trait NetworkObserver: Send + Sync {
    fn on_state_change(&self, _change: &StateChange) {}

    /// A peer sent its first presentation. Returning false suppresses the reply.
    fn on_new_peer(&self, _peer: &Peer) -> bool {
        true
    }

    /// Non-heartbeat traffic was delivered to `peer` over `transport`.
    fn on_send_activity(&self, _peer: PeerHandle, _transport: TransportKind) {}
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<u16, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<(), NetError> {
        let id = service.id();
        if id == 0 || self.services.contains_key(&id) {
            return Err(NetError::InvalidServiceId(id));
        }
        tracing::info!(id, name = service.name(), "service registered");
        self.services.insert(id, service);
        Ok(())
    }

    pub fn unregister(&mut self, id: u16) -> Option<Arc<dyn Service>> {
        self.services.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<Arc<dyn Service>> {
        self.services.get(&id).cloned()
    }

    /// Calls every service's shutdown and empties the registry.
    pub fn shutdown_all(&mut self) {
        for (id, service) in std::mem::take(&mut self.services) {
            tracing::debug!(id, name = service.name(), "shutting down service");
            service.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
