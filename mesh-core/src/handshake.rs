//! Handshake: presentations (HI / HIR) that exchange capabilities and set up
//! relation ids for compact addressing.
//!
//! Payload of a `Network` message:
//! ```text
//! 0 request | 1 version | 2 min version | 3 transports | 4 i2c | 5 can | 6 reason |
//! 7..11 relation id (LE) | 11..17 mac | name NUL
//! ```

use std::time::{Duration, Instant};

use crate::checksum;
use crate::error::NetError;
use crate::health::{HealthState, Problem};
use crate::network::Network;
use crate::peer::{truncate_name, MacAddress, PeerHandle, PeerState};
use crate::protocol::{
    MessageKind, NetworkRequest, PresentationReason, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN,
};
use crate::relation::Relation;
use crate::send::{ItemKind, WorkItem};
use crate::transport::{TransportKind, TransportSet};
use crate::wire::{self, Message};

pub const PRESENTATION_HEADER_LEN: usize = 17;

/// Id that the owner of `local` hands to the owner of `peer` for addressing it.
/// Both sides derive the same value from the same pair of addresses.
pub fn relation_id(peer: &MacAddress, local: &MacAddress) -> u32 {
    let mut buf = [0u8; 12];
    buf[..6].copy_from_slice(peer.as_bytes());
    buf[6..].copy_from_slice(local.as_bytes());
    checksum::crc32(&buf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presentation {
    pub request: NetworkRequest,
    pub protocol_version: u8,
    pub min_protocol_version: u8,
    pub supported: TransportSet,
    pub i2c_address: u8,
    pub can_address: u8,
    pub reason: PresentationReason,
    /// The sender's incoming relation id for the receiver.
    pub relation_id: u32,
    pub mac: MacAddress,
    pub name: String,
}

impl Presentation {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PRESENTATION_HEADER_LEN + self.name.len() + 1);
        out.push(self.request as u8);
        out.push(self.protocol_version);
        out.push(self.min_protocol_version);
        out.push(self.supported.bits());
        out.push(self.i2c_address);
        out.push(self.can_address);
        out.push(self.reason as u8);
        out.extend_from_slice(&self.relation_id.to_le_bytes());
        out.extend_from_slice(self.mac.as_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, NetError> {
        let Some(&code) = data.first() else {
            return Err(NetError::Protocol("empty network message".into()));
        };
        let request = NetworkRequest::try_from(code)
            .map_err(|c| NetError::Protocol(format!("unknown network request {c:#04x}")))?;
        if data.len() < PRESENTATION_HEADER_LEN {
            return Err(NetError::Protocol(format!(
                "presentation too short: {} bytes",
                data.len()
            )));
        }
        let reason = PresentationReason::try_from(data[6])
            .map_err(|r| NetError::Protocol(format!("unknown presentation reason {r}")))?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[11..17]);
        let name_bytes = &data[PRESENTATION_HEADER_LEN..];
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = std::str::from_utf8(&name_bytes[..end])
            .map_err(|_| NetError::Protocol("peer name is not UTF-8".into()))?;
        Ok(Self {
            request,
            protocol_version: data[1],
            min_protocol_version: data[2],
            supported: TransportSet::from_bits(data[3]),
            i2c_address: data[4],
            can_address: data[5],
            reason,
            relation_id: u32::from_le_bytes([data[7], data[8], data[9], data[10]]),
            mac: MacAddress(mac),
            name: truncate_name(name),
        })
    }
}

impl Network {
    /// Introduce ourselves to `peer` on each of `transports` in turn until one
    /// round-trips. A reply (HIR) only needs to be handed to the transport.
    pub fn send_presentation(
        &self,
        peer: PeerHandle,
        transports: TransportSet,
        reply: bool,
        reason: PresentationReason,
    ) -> Result<(), NetError> {
        let now = self.now();
        let (candidates, failstate, body, name) = {
            let mut peers = self.peers.lock();
            let p = peers.get_mut(peer).ok_or(NetError::PeerNotFound)?;
            if p.state == PeerState::Presenting {
                tracing::warn!(peer = %p.name, "presentation already in progress");
                return Err(NetError::AlreadyPresenting);
            }
            if p.state == PeerState::Banned {
                return Err(NetError::PeerBanned);
            }
            let failstate = if reply { p.state } else { PeerState::Unknown };
            if !reply {
                p.state = PeerState::Presenting;
            }
            p.relation_id_incoming = relation_id(&p.mac, &self.host.mac);

            let mut candidates = transports.intersection(self.host_transports());
            if !p.supported.is_empty() {
                candidates = candidates.intersection(p.supported);
            }
            p.track(candidates, now);

            let presentation = Presentation {
                request: if reply {
                    NetworkRequest::Hir
                } else {
                    NetworkRequest::Hi
                },
                protocol_version: PROTOCOL_VERSION,
                min_protocol_version: PROTOCOL_VERSION_MIN,
                supported: self.host_transports(),
                i2c_address: self.host.i2c_address,
                can_address: self.host.can_address,
                reason,
                relation_id: p.relation_id_incoming,
                mac: self.host.mac,
                name: self.host.name.clone(),
            };
            let msg = Message::binary(MessageKind::Network, presentation.encode());
            let body = wire::encode(&msg, self.config.checksum);
            (candidates, failstate, body, p.name.clone())
        };
        let body = match body {
            Ok(b) => b,
            Err(e) => {
                self.restore_presenting(peer, failstate);
                return Err(e.into());
            }
        };

        let mut last_err = NetError::NoSuitableTransport;
        for kind in candidates.iter() {
            tracing::info!(peer = %name, transport = %kind, ?reason, reply, "sending presentation");
            match self.present_on(peer, kind, body.clone()) {
                Ok(()) => {}
                Err(err) => {
                    tracing::warn!(peer = %name, transport = %kind, %err, "presentation not sent");
                    self.mark_problem(peer, kind, Problem::SendFailure);
                    last_err = err;
                    continue;
                }
            }
            if reply {
                return Ok(());
            }
            match self.wait_known(
                peer,
                Duration::from_millis(self.config.presentation_timeout_ms),
            ) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(peer = %name, transport = %kind, "no answer to presentation");
                    last_err = err;
                }
            }
        }
        self.restore_presenting(peer, failstate);
        Err(last_err)
    }

    /// Queue one presentation and wait for the transport to take it.
    fn present_on(&self, peer: PeerHandle, kind: TransportKind, body: Vec<u8>) -> Result<(), NetError> {
        let item = WorkItem::new(peer, ItemKind::Presentation, body);
        let outcome = item.outcome.clone();
        self.enqueue(kind, item)?;
        outcome
            .wait(Duration::from_millis(self.config.queue_timeout_ms))
            .unwrap_or(Err(NetError::Timeout))
            .map(|_| ())
    }

    fn restore_presenting(&self, peer: PeerHandle, failstate: PeerState) {
        let mut peers = self.peers.lock();
        if let Some(p) = peers.get_mut(peer) {
            if p.state == PeerState::Presenting {
                p.state = failstate;
            }
        }
        drop(peers);
        self.peers_changed.notify_all();
    }

    /// Block until `peer` has completed a handshake, or `timeout` passes.
    pub fn wait_known(&self, peer: PeerHandle, timeout: Duration) -> Result<(), NetError> {
        let deadline = Instant::now() + timeout;
        let mut peers = self.peers.lock();
        loop {
            match peers.get(peer).map(|p| p.state) {
                None => return Err(NetError::PeerNotFound),
                Some(s) if s.is_known() => return Ok(()),
                Some(_) => {}
            }
            if self.peers_changed.wait_until(&mut peers, deadline).timed_out() {
                return match peers.get(peer).map(|p| p.state) {
                    Some(s) if s.is_known() => Ok(()),
                    _ => Err(NetError::Timeout),
                };
            }
        }
    }

    /// Apply a presentation received from `from` over `kind`, persist the
    /// relation and answer a HI with a HIR.
    pub fn handle_presentation(
        &self,
        from: PeerHandle,
        kind: TransportKind,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let p = match Presentation::decode(payload) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(transport = %kind, %err, "bad presentation");
                self.mark_suspect(from);
                return Err(err);
            }
        };
        let now = self.now();
        let (handle, change, relation, snapshot) = {
            let mut peers = self.peers.lock();
            let mut handle = from;
            if let Some(existing) = peers.find_by_mac(&p.mac) {
                if existing != from {
                    tracing::warn!(mac = %p.mac, "peer already known by address, merging");
                    peers.remove(from);
                    handle = existing;
                }
            }
            let name_taken = peers
                .find_by_name(&p.name)
                .is_some_and(|other| other != handle);
            let peer = peers.get_mut(handle).ok_or(NetError::PeerNotFound)?;
            if peer.state == PeerState::Banned {
                tracing::debug!(peer = %peer.name, "ignoring presentation from banned peer");
                return Ok(());
            }
            peer.mac = p.mac;
            peer.protocol_version = p.protocol_version;
            peer.min_protocol_version = p.min_protocol_version;
            peer.supported = p.supported;
            peer.i2c_address = p.i2c_address;
            peer.can_address = p.can_address;
            peer.relation_id_outgoing = p.relation_id;
            peer.relation_id_incoming = relation_id(&p.mac, &self.host.mac);
            if !p.name.is_empty() && !name_taken {
                peer.name = p.name.clone();
            }
            let mut wanted = p.supported.intersection(self.host_transports());
            wanted.insert(kind);
            let fresh = peer.track(wanted, now);
            if !fresh.is_empty() {
                tracing::debug!(peer = %peer.name, transports = ?fresh, "tracking new transports");
            }
            peer.state = PeerState::KnownInsecure;
            peer.reset_stats(now);
            let change = peer.set_health_state(kind, HealthState::Working, Problem::None, now);
            let relation = Relation {
                mac: peer.mac,
                relation_id_incoming: peer.relation_id_incoming,
                relation_id_outgoing: peer.relation_id_outgoing,
                supported: peer.supported,
                i2c_address: peer.i2c_address,
                can_address: peer.can_address,
            };
            tracing::info!(peer = %peer.name, transport = %kind, reason = ?p.reason, "peer presented itself");
            (handle, change, relation, peer.clone())
        };
        self.peers_changed.notify_all();
        self.notify_changes(change.as_slice());

        let persisted = self.persist_relation(relation);

        if p.request == NetworkRequest::Hi {
            if self.approve_new_peer(&snapshot) {
                if let Err(err) =
                    self.send_presentation(handle, kind.into(), true, PresentationReason::Reply)
                {
                    tracing::warn!(peer = %snapshot.name, %err, "failed to answer presentation");
                }
            } else {
                tracing::warn!(peer = %snapshot.name, "new peer vetoed, not answering");
            }
        }
        persisted
    }

    /// Record a confirmed peer in the relation table and the store.
    fn persist_relation(&self, relation: Relation) -> Result<(), NetError> {
        let added = self.relations.lock().add(relation.clone())?;
        if added {
            if let Some(store) = &self.store {
                if let Err(err) = store.append(&relation) {
                    tracing::warn!(mac = %relation.mac, %err, "could not persist relation");
                }
            }
        }
        Ok(())
    }

    /// Rebuild peers from persisted relations after a restart.
    pub fn recover_relations(&self) -> Result<usize, NetError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load().map_err(|e| NetError::Store(e.to_string()))?;
        if loaded.is_empty() {
            tracing::info!("no relations to recover");
            return Ok(0);
        }
        tracing::warn!(count = loaded.len(), "recovering peers from relations");
        let now = self.now();
        let mut recovered = 0;
        for relation in loaded {
            match self.relations.lock().add(relation.clone()) {
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(mac = %relation.mac, %err, "relation not restored");
                    continue;
                }
            }
            let mut peers = self.peers.lock();
            let handle = peers.get_or_add_by_mac(relation.mac);
            if let Some(p) = peers.get_mut(handle) {
                p.relation_id_incoming = relation.relation_id_incoming;
                p.relation_id_outgoing = relation.relation_id_outgoing;
                p.supported = relation.supported;
                p.i2c_address = relation.i2c_address;
                p.can_address = relation.can_address;
                p.state = PeerState::KnownInsecure;
                p.track(relation.supported.intersection(self.host_transports()), now);
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0xA]);
    const B: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0xB]);

    fn sample() -> Presentation {
        Presentation {
            request: NetworkRequest::Hi,
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: PROTOCOL_VERSION_MIN,
            supported: [TransportKind::Lora, TransportKind::EspNow].into_iter().collect(),
            i2c_address: 0x20,
            can_address: 0x11,
            reason: PresentationReason::Add,
            relation_id: relation_id(&B, &A),
            mac: A,
            name: "node-a".into(),
        }
    }

    #[test]
    fn layout_matches_wire_format() {
        let bytes = sample().encode();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[3], 4 | 2);
        assert_eq!(bytes[4], 0x20);
        assert_eq!(bytes[5], 0x11);
        assert_eq!(&bytes[7..11], &relation_id(&B, &A).to_le_bytes());
        assert_eq!(&bytes[11..17], A.as_bytes());
        assert_eq!(&bytes[17..], b"node-a\0");
        assert_eq!(Presentation::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn relation_ids_agree_across_sides() {
        // A computes its incoming id for B and sends it; B stores it as outgoing.
        let a_incoming_for_b = relation_id(&B, &A);
        let mut hi = sample();
        hi.relation_id = a_incoming_for_b;
        let parsed = Presentation::decode(&hi.encode()).unwrap();
        assert_eq!(parsed.relation_id, a_incoming_for_b);
        assert_ne!(relation_id(&A, &B), relation_id(&B, &A));
    }

    #[test]
    fn unknown_request_code_is_protocol_error() {
        let mut bytes = sample().encode();
        bytes[0] = 0x85;
        assert!(matches!(
            Presentation::decode(&bytes),
            Err(NetError::Protocol(_))
        ));
        assert!(matches!(Presentation::decode(&[]), Err(NetError::Protocol(_))));
    }

    #[test]
    fn short_or_unterminated_payloads() {
        let bytes = sample().encode();
        assert!(Presentation::decode(&bytes[..10]).is_err());
        let unterminated = &bytes[..bytes.len() - 1];
        assert_eq!(Presentation::decode(unterminated).unwrap().name, "node-a");
    }
}
