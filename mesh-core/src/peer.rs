//! Peers: remote nodes, kept in an arena indexed by stable handles.

use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::health::{HealthState, Problem, StateChange, TransportHealth};
use crate::protocol::PEER_NAME_LEN;
use crate::transport::{PeerAddress, TransportKind, TransportSet};

/// 6-byte primary (link) address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Random locally administered unicast address.
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] | 0x02) & 0xFE;
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl std::str::FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("short MAC address: {s}"))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| format!("bad MAC address: {s}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("long MAC address: {s}"));
        }
        Ok(Self(out))
    }
}

/// Stable index of a peer in the arena. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub(crate) u32);

impl PeerHandle {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coarse peer-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerState {
    Unknown,
    Presenting,
    KnownInsecure,
    KnownSecure,
    KnownSuspect,
    Banned,
}

impl PeerState {
    /// Handshake has completed at some point.
    pub fn is_known(self) -> bool {
        matches!(
            self,
            PeerState::KnownInsecure | PeerState::KnownSecure | PeerState::KnownSuspect
        )
    }
}

/// One remote node.
#[derive(Debug, Clone)]
pub struct Peer {
    pub handle: PeerHandle,
    pub name: String,
    pub mac: MacAddress,
    pub i2c_address: u8,
    pub can_address: u8,
    /// Id the peer uses to address us; derived locally.
    pub relation_id_incoming: u32,
    /// Id we use to address the peer; learned from its presentation.
    pub relation_id_outgoing: u32,
    pub protocol_version: u8,
    pub min_protocol_version: u8,
    pub supported: TransportSet,
    /// Transports whose health is worse than `Working`.
    pub problematic: TransportSet,
    pub state: PeerState,
    health: BTreeMap<TransportKind, TransportHealth>,
}

impl Peer {
    fn new(handle: PeerHandle, name: String) -> Self {
        Self {
            handle,
            name,
            mac: MacAddress::default(),
            i2c_address: 0,
            can_address: 0,
            relation_id_incoming: 0,
            relation_id_outgoing: 0,
            protocol_version: 0,
            min_protocol_version: 0,
            supported: TransportSet::empty(),
            problematic: TransportSet::empty(),
            state: PeerState::Unknown,
            health: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress {
            mac: self.mac,
            i2c_address: self.i2c_address,
            can_address: self.can_address,
        }
    }

    pub fn health(&self, kind: TransportKind) -> Option<&TransportHealth> {
        self.health.get(&kind)
    }

    pub fn health_mut(&mut self, kind: TransportKind) -> Option<&mut TransportHealth> {
        self.health.get_mut(&kind)
    }

    /// Transports that have a health record.
    pub fn tracked(&self) -> TransportSet {
        self.health.keys().copied().collect()
    }

    /// Create health records for transports that do not have one yet.
    /// Returns the newly tracked transports.
    pub fn track(&mut self, kinds: TransportSet, now: u64) -> TransportSet {
        let fresh = kinds.difference(self.tracked());
        for kind in fresh.iter() {
            self.health.insert(kind, TransportHealth::new(now));
        }
        fresh
    }

    /// Zero counters and restart all timestamps, e.g. after a handshake.
    pub fn reset_stats(&mut self, now: u64) {
        for h in self.health.values_mut() {
            h.reset_stats(now);
        }
    }

    /// The single transition function for transport health. Keeps the
    /// problematic set in step with the state. Returns the change, if any.
    pub fn set_health_state(
        &mut self,
        kind: TransportKind,
        state: HealthState,
        problem: Problem,
        now: u64,
    ) -> Option<StateChange> {
        let h = self.health.get_mut(&kind)?;
        if h.state == state && h.problem == problem {
            return None;
        }
        let change = StateChange {
            peer: self.handle,
            peer_name: self.name.clone(),
            transport: kind,
            from: h.state,
            to: state,
            previous_problem: h.problem,
            problem,
        };
        h.state = state;
        h.problem = problem;
        h.last_state_change = now;
        if state > HealthState::Working {
            self.problematic.insert(kind);
            tracing::warn!(peer = %self.name, transport = %kind, "{} -> {} ({})", change.from, state, problem);
        } else {
            self.problematic.remove(kind);
            tracing::info!(peer = %self.name, transport = %kind, "{} -> {}", change.from, state);
        }
        Some(change)
    }
}

/// Arena of peers. Handles stay valid until the peer is removed.
pub struct PeerTable {
    peers: BTreeMap<PeerHandle, Peer>,
    next_handle: u32,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            next_handle: 1,
        }
    }

    /// Add a peer. Names must be unique; an empty name becomes `UNKNOWN_<handle>`.
    pub fn add(&mut self, name: &str) -> Result<PeerHandle, NetError> {
        let handle = PeerHandle(self.next_handle);
        let name = if name.is_empty() {
            format!("UNKNOWN_{}", handle.0)
        } else {
            truncate_name(name)
        };
        if self.find_by_name(&name).is_some() {
            return Err(NetError::PeerExists);
        }
        self.next_handle += 1;
        self.peers.insert(handle, Peer::new(handle, name));
        Ok(handle)
    }

    /// Peer with this MAC, created (unnamed, `Unknown`) if missing.
    pub fn get_or_add_by_mac(&mut self, mac: MacAddress) -> PeerHandle {
        if let Some(h) = self.find_by_mac(&mac) {
            return h;
        }
        let handle = PeerHandle(self.next_handle);
        self.next_handle += 1;
        let mut peer = Peer::new(handle, format!("UNKNOWN_{}", handle.0));
        peer.mac = mac;
        self.peers.insert(handle, peer);
        handle
    }

    pub fn remove(&mut self, handle: PeerHandle) -> Option<Peer> {
        self.peers.remove(&handle)
    }

    pub fn get(&self, handle: PeerHandle) -> Option<&Peer> {
        self.peers.get(&handle)
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        self.peers.get_mut(&handle)
    }

    pub fn find_by_name(&self, name: &str) -> Option<PeerHandle> {
        self.find(|p| p.name == name)
    }

    pub fn find_by_mac(&self, mac: &MacAddress) -> Option<PeerHandle> {
        if mac.is_zero() {
            return None;
        }
        self.find(|p| p.mac == *mac)
    }

    pub fn find_by_relation_id(&self, relation_id_incoming: u32) -> Option<PeerHandle> {
        if relation_id_incoming == 0 {
            return None;
        }
        self.find(|p| p.relation_id_incoming == relation_id_incoming)
    }

    /// Bus address lookup for I2C and CAN bus.
    pub fn find_by_bus_address(&self, kind: TransportKind, address: u8) -> Option<PeerHandle> {
        match kind {
            TransportKind::I2c => self.find(|p| p.i2c_address == address),
            TransportKind::CanBus => self.find(|p| p.can_address == address),
            _ => None,
        }
    }

    fn find(&self, pred: impl Fn(&Peer) -> bool) -> Option<PeerHandle> {
        self.peers.values().find(|p| pred(p)).map(|p| p.handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Cut a name to what fits on the wire, on a char boundary.
pub fn truncate_name(name: &str) -> String {
    let max = PEER_NAME_LEN - 1;
    if name.len() <= max {
        return name.to_string();
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
