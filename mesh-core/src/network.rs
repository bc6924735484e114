//! The node: owns the peer and relation tables, the transports and their send
//! queues, and routes inbound frames to the handshake, heartbeat, fragment and
//! service layers.
//!
//! The host drives time: it calls [`Network::tick_health`],
//! [`Network::send_heartbeats`] and [`Network::refresh_scores`] periodically.
//! [`Network::start`] spawns one send worker and one poller per transport; tests
//! may instead call [`Network::pump`] and [`Network::process_next`] by hand.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::clock::Clock;
use crate::config::NetConfig;
use crate::error::NetError;
use crate::fragment::{
    self, Completion, FragmentError, FragmentFrame, OutgoingTransfer, Reassembler, ResultCode,
};
use crate::health::{
    self, CheckOutcome, HealthAction, HealthState, Problem, QosTimings, StateChange,
};
use crate::handshake::Presentation;
use crate::heartbeat::encode_delta;
use crate::peer::{truncate_name, MacAddress, Peer, PeerHandle, PeerState, PeerTable};
use crate::protocol::{MessageKind, PresentationReason};
use crate::relation::{RelationStore, RelationTable};
use crate::scoring;
use crate::send::{ItemKind, SendQueue};
use crate::service::{Inbound, InboundHandler, NetworkObserver, Service, ServiceRegistry};
use crate::transport::{Frame, InBandPrefix, LinkSource, Transport, TransportKind, TransportSet};
use crate::wire::{self, DecodeError, Message, MIN_MESSAGE_LEN};

const WORKER_WAIT: Duration = Duration::from_millis(100);
const POLL_IDLE: Duration = Duration::from_millis(2);

/// Sender of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sender {
    Known(PeerHandle),
    /// A MAC with no peer record yet.
    Stranger(MacAddress),
}

/// Who this node is on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub name: String,
    pub mac: MacAddress,
    pub i2c_address: u8,
    pub can_address: u8,
}

impl HostIdentity {
    pub fn new(name: &str, mac: MacAddress) -> Self {
        Self {
            name: truncate_name(name),
            mac,
            i2c_address: 0,
            can_address: 0,
        }
    }

    pub fn with_bus_addresses(mut self, i2c_address: u8, can_address: u8) -> Self {
        self.i2c_address = i2c_address;
        self.can_address = can_address;
        self
    }
}

pub struct Network {
    pub(crate) config: NetConfig,
    pub(crate) timings: QosTimings,
    pub(crate) host: HostIdentity,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) peers: Mutex<PeerTable>,
    /// Signalled whenever a peer's handshake state moves.
    pub(crate) peers_changed: Condvar,
    pub(crate) relations: Mutex<RelationTable>,
    pub(crate) store: Option<Arc<dyn RelationStore>>,
    pub(crate) transports: BTreeMap<TransportKind, Arc<dyn Transport>>,
    pub(crate) queues: BTreeMap<TransportKind, SendQueue>,
    pub(crate) reassembler: Mutex<Reassembler>,
    /// Fragmented sends waiting for the receiver's verdict, by body hash.
    pub(crate) outgoing: Mutex<HashMap<u32, Arc<OutgoingTransfer>>>,
    services: RwLock<ServiceRegistry>,
    observers: RwLock<Vec<Arc<dyn NetworkObserver>>>,
    inbound: RwLock<Option<Arc<dyn InboundHandler>>>,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Network {
    pub fn new(config: NetConfig, host: HostIdentity, clock: Arc<dyn Clock>) -> Self {
        Self {
            timings: QosTimings::from_config(&config),
            relations: Mutex::new(RelationTable::new(config.max_relations)),
            reassembler: Mutex::new(Reassembler::new(config.max_fragmented_len)),
            config,
            host,
            clock,
            peers: Mutex::new(PeerTable::new()),
            peers_changed: Condvar::new(),
            store: None,
            transports: BTreeMap::new(),
            queues: BTreeMap::new(),
            outgoing: Mutex::new(HashMap::new()),
            services: RwLock::new(ServiceRegistry::new()),
            observers: RwLock::new(Vec::new()),
            inbound: RwLock::new(None),
            running: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Register a driver. Replaces any driver of the same kind.
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) {
        let kind = transport.kind();
        tracing::info!(transport = %kind, max_frame = transport.max_frame_len(), "transport added");
        self.queues
            .insert(kind, SendQueue::new(self.config.queue_capacity));
        self.transports.insert(kind, transport);
    }

    pub fn set_relation_store(&mut self, store: Arc<dyn RelationStore>) {
        self.store = Some(store);
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn host(&self) -> &HostIdentity {
        &self.host
    }

    /// Transports this node has drivers for.
    pub fn host_transports(&self) -> TransportSet {
        self.transports.keys().copied().collect()
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn register_service(&self, service: Arc<dyn Service>) -> Result<(), NetError> {
        self.services.write().register(service)
    }

    pub fn unregister_service(&self, id: u16) -> bool {
        self.services.write().unregister(id).is_some()
    }

    /// Receiver of application messages that are not service calls.
    pub fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.inbound.write() = Some(handler);
    }

    pub fn add_observer(&self, observer: Arc<dyn NetworkObserver>) {
        self.observers.write().push(observer);
    }

    /// Add a peer we know by name and address. No presentation is sent until
    /// the first send or health check.
    pub fn add_peer(
        &self,
        name: &str,
        mac: MacAddress,
        supported: TransportSet,
    ) -> Result<PeerHandle, NetError> {
        let now = self.now();
        let mut peers = self.peers.lock();
        if peers.find_by_mac(&mac).is_some() {
            return Err(NetError::PeerExists);
        }
        let handle = peers.add(name)?;
        if let Some(p) = peers.get_mut(handle) {
            p.mac = mac;
            p.supported = supported;
            let kinds = if supported.is_empty() {
                self.host_transports()
            } else {
                supported.intersection(self.host_transports())
            };
            p.track(kinds, now);
        }
        Ok(handle)
    }

    /// The peer with this address, created and presented to if new. A failed
    /// presentation is retried by the health check.
    pub fn add_peer_by_mac(&self, mac: MacAddress) -> Result<PeerHandle, NetError> {
        if mac.is_zero() || mac == self.host.mac {
            return Err(NetError::Protocol(format!("cannot add peer {mac}")));
        }
        let handle = {
            let mut peers = self.peers.lock();
            if let Some(existing) = peers.find_by_mac(&mac) {
                return Ok(existing);
            }
            peers.get_or_add_by_mac(mac)
        };
        if let Err(err) = self.send_presentation(
            handle,
            TransportSet::all(),
            false,
            PresentationReason::Add,
        ) {
            tracing::warn!(%mac, %err, "new peer did not answer");
        }
        Ok(handle)
    }

    pub fn remove_peer(&self, peer: PeerHandle) -> Result<(), NetError> {
        let removed = self.peers.lock().remove(peer);
        self.peers_changed.notify_all();
        match removed {
            Some(p) => {
                tracing::info!(peer = %p.name, "peer removed");
                Ok(())
            }
            None => Err(NetError::PeerNotFound),
        }
    }

    /// Ignore everything from this peer from now on.
    pub fn ban_peer(&self, peer: PeerHandle) -> Result<(), NetError> {
        {
            let mut peers = self.peers.lock();
            let p = peers.get_mut(peer).ok_or(NetError::PeerNotFound)?;
            tracing::warn!(peer = %p.name, "peer banned");
            p.state = PeerState::Banned;
        }
        self.peers_changed.notify_all();
        Ok(())
    }

    /// Snapshot of one peer.
    pub fn peer(&self, peer: PeerHandle) -> Option<Peer> {
        self.peers.lock().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.lock().iter().cloned().collect()
    }

    pub fn find_peer_by_name(&self, name: &str) -> Option<PeerHandle> {
        self.peers.lock().find_by_name(name)
    }

    pub fn find_peer_by_mac(&self, mac: &MacAddress) -> Option<PeerHandle> {
        self.peers.lock().find_by_mac(mac)
    }

    /// Prefix to put in front of a frame to `p` on `kind`.
    pub(crate) fn prefix_for(&self, p: &Peer, kind: TransportKind, mac_form: bool) -> Vec<u8> {
        if !kind.in_band_addressing() {
            return Vec::new();
        }
        let prefix = if p.relation_id_outgoing != 0 && !mac_form {
            InBandPrefix::Relation(p.relation_id_outgoing)
        } else {
            InBandPrefix::Macs {
                dest: p.mac,
                src: self.host.mac,
            }
        };
        prefix.to_bytes()
    }

    /// Skip the next health check of this transport and restart its clocks.
    pub(crate) fn postpone(&self, peer: PeerHandle, kind: TransportKind) {
        if let Some(h) = self.peers.lock().get_mut(peer).and_then(|p| p.health_mut(kind)) {
            h.postpone = true;
        }
    }

    pub(crate) fn mark_problem(&self, peer: PeerHandle, kind: TransportKind, problem: Problem) {
        let now = self.now();
        let change = self
            .peers
            .lock()
            .get_mut(peer)
            .and_then(|p| p.set_health_state(kind, HealthState::Problem, problem, now));
        self.notify_changes(change.as_slice());
    }

    /// A known peer sent something that passed the checksum but made no sense.
    pub(crate) fn mark_suspect(&self, peer: PeerHandle) {
        let mut peers = self.peers.lock();
        if let Some(p) = peers.get_mut(peer) {
            if p.state.is_known() && p.state != PeerState::KnownSuspect {
                tracing::warn!(peer = %p.name, "peer is now suspect");
                p.state = PeerState::KnownSuspect;
            }
        }
    }

    pub(crate) fn notify_changes(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for change in changes {
            for o in &observers {
                o.on_state_change(change);
            }
        }
    }

    pub(crate) fn notify_send_activity(&self, peer: PeerHandle, kind: TransportKind) {
        let observers = self.observers.read().clone();
        for o in &observers {
            o.on_send_activity(peer, kind);
        }
    }

    /// Every observer must agree before we answer a new peer.
    pub(crate) fn approve_new_peer(&self, peer: &Peer) -> bool {
        let observers = self.observers.read().clone();
        observers.iter().all(|o| o.on_new_peer(peer))
    }

    /// Process one frame received on `kind`.
    pub fn handle_frame(&self, kind: TransportKind, frame: Frame) {
        let Some((sender, prefix_len)) = self.resolve_sender(kind, &frame) else {
            tracing::trace!(transport = %kind, len = frame.data.len(), "frame from unknown sender dropped");
            return;
        };
        let body = &frame.data[prefix_len..];
        let peer = match sender {
            Sender::Known(peer) => peer,
            Sender::Stranger(mac) => return self.handle_stranger(kind, mac, body),
        };
        if self
            .peers
            .lock()
            .get(peer)
            .map_or(true, |p| p.state == PeerState::Banned)
        {
            return;
        }
        if fragment::is_fragment_frame(body) {
            self.record_receive(peer, kind, true);
            self.handle_fragment(peer, kind, body);
            return;
        }
        if body.len() < MIN_MESSAGE_LEN {
            tracing::debug!(peer = %peer, transport = %kind, "runt frame dropped");
            return;
        }
        match wire::decode(body, 0) {
            Ok(msg) => {
                self.record_receive(peer, kind, true);
                self.dispatch(peer, kind, msg);
            }
            Err(DecodeError::ChecksumMismatch) => {
                tracing::warn!(peer = %peer, transport = %kind, "checksum mismatch");
                self.record_receive(peer, kind, false);
                if let Some(h) = self.peers.lock().get_mut(peer).and_then(|p| p.health_mut(kind)) {
                    h.crc_mismatches += 1;
                }
            }
            Err(err) => {
                tracing::warn!(peer = %peer, transport = %kind, %err, "undecodable message");
                self.record_receive(peer, kind, false);
                self.mark_suspect(peer);
            }
        }
    }

    /// Work out who sent a frame and how long its prefix is. Never creates a
    /// peer for an unseen MAC; see [`Network::handle_stranger`].
    fn resolve_sender(&self, kind: TransportKind, frame: &Frame) -> Option<(Sender, usize)> {
        if kind.in_band_addressing() {
            let prefix = InBandPrefix::parse(&frame.data, &self.host.mac)?;
            let sender = match prefix {
                InBandPrefix::Macs { src, .. } => self.sender_by_mac(src)?,
                InBandPrefix::Relation(id) => {
                    let mut peers = self.peers.lock();
                    match peers.find_by_relation_id(id) {
                        Some(h) => Sender::Known(h),
                        None => {
                            // persisted relation whose peer was not rebuilt yet
                            let mac = self.relations.lock().mac_for_incoming(id)?;
                            Sender::Known(peers.get_or_add_by_mac(mac))
                        }
                    }
                }
            };
            return Some((sender, prefix.len()));
        }
        let sender = match frame.source? {
            LinkSource::Mac(mac) => self.sender_by_mac(mac)?,
            LinkSource::Bus(address) => {
                Sender::Known(self.peers.lock().find_by_bus_address(kind, address)?)
            }
        };
        Some((sender, 0))
    }

    fn sender_by_mac(&self, mac: MacAddress) -> Option<Sender> {
        if mac.is_zero() || mac == self.host.mac {
            return None;
        }
        Some(match self.peers.lock().find_by_mac(&mac) {
            Some(h) => Sender::Known(h),
            None => Sender::Stranger(mac),
        })
    }

    /// A frame from a MAC with no peer record. Only a well-formed presentation
    /// introduces a new peer; anything else is dropped.
    fn handle_stranger(&self, kind: TransportKind, mac: MacAddress, body: &[u8]) {
        let msg = match wire::decode(body, 0) {
            Ok(msg) if msg.kind == MessageKind::Network => msg,
            Ok(msg) => {
                tracing::warn!(%mac, transport = %kind, kind = ?msg.kind, "message from unknown sender dropped");
                return;
            }
            Err(err) => {
                tracing::warn!(%mac, transport = %kind, %err, "undecodable frame from unknown sender dropped");
                return;
            }
        };
        if let Err(err) = Presentation::decode(&msg.binary) {
            tracing::warn!(%mac, transport = %kind, %err, "bad presentation from unknown sender dropped");
            return;
        }
        let peer = self.peers.lock().get_or_add_by_mac(mac);
        self.record_receive(peer, kind, true);
        self.dispatch(peer, kind, msg);
    }

    fn record_receive(&self, peer: PeerHandle, kind: TransportKind, ok: bool) {
        let now = self.now();
        let mut peers = self.peers.lock();
        let Some(p) = peers.get_mut(peer) else {
            return;
        };
        if self.transports.contains_key(&kind) {
            p.track(kind.into(), now);
        }
        if let Some(h) = p.health_mut(kind) {
            h.record_receive(ok, now);
        }
    }

    fn dispatch(&self, peer: PeerHandle, kind: TransportKind, msg: Message) {
        match msg.kind {
            MessageKind::Network => {
                if let Err(err) = self.handle_presentation(peer, kind, &msg.binary) {
                    tracing::debug!(peer = %peer, transport = %kind, %err, "presentation not fully applied");
                }
            }
            MessageKind::Heartbeat => self.handle_heartbeat(peer, kind, &msg),
            MessageKind::Message | MessageKind::Stream => self.deliver_inbound(peer, kind, msg),
            MessageKind::Fragmented => {
                tracing::warn!(peer = %peer, transport = %kind, "fragment kind inside a message");
            }
        }
    }

    fn deliver_inbound(&self, peer: PeerHandle, kind: TransportKind, message: Message) {
        let peer_name = self
            .peers
            .lock()
            .get(peer)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let inbound = Inbound {
            peer,
            peer_name,
            transport: kind,
            message,
        };
        if let Some(id) = inbound.message.service_id {
            let service = self.services.read().get(id);
            match service {
                Some(s) => s.on_message(&inbound),
                None => tracing::warn!(service = id, peer = %inbound.peer_name, "no such service, message dropped"),
            }
            return;
        }
        let handler = self.inbound.read().clone();
        match handler {
            Some(h) => h.on_message(&inbound),
            None => tracing::debug!(peer = %inbound.peer_name, "no inbound handler, message dropped"),
        }
    }

    fn handle_fragment(&self, peer: PeerHandle, kind: TransportKind, body: &[u8]) {
        let frame = match FragmentFrame::parse(body) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(peer = %peer, transport = %kind, %err, "bad fragment frame");
                return;
            }
        };
        let max_resend = self.max_resend(peer, kind);
        let (hash, result) = match frame {
            FragmentFrame::Init(header) => {
                let started = self
                    .reassembler
                    .lock()
                    .start(peer, kind, header, self.now());
                if let Err(err) = started {
                    tracing::warn!(peer = %peer, transport = %kind, %err, "fragmented transfer refused");
                    self.send_fragment_control(
                        peer,
                        kind,
                        FragmentFrame::Result {
                            hash: header.hash,
                            code: ResultCode::Failed,
                        },
                    );
                }
                return;
            }
            FragmentFrame::Data { hash, index, chunk } => {
                let mut reassembler = self.reassembler.lock();
                if reassembler.origin(hash) != Some((peer, kind)) {
                    tracing::warn!(peer = %peer, transport = %kind, hash, "fragment for unknown transfer dropped");
                    return;
                }
                match reassembler.accept(hash, index, chunk, max_resend) {
                    Ok(Some(c)) => (hash, Ok(c)),
                    Ok(None) => return,
                    Err(err) => (hash, Err(err)),
                }
            }
            FragmentFrame::Check { hash } => {
                let checked = self.reassembler.lock().check(hash, max_resend);
                (hash, checked)
            }
            FragmentFrame::Resend { hash, missing } => {
                self.resend_fragments(hash, &missing);
                return;
            }
            FragmentFrame::Result { hash, code } => {
                let transfer = self.outgoing.lock().get(&hash).cloned();
                match transfer {
                    Some(t) => {
                        t.outcome.complete(code.into_result());
                    }
                    None => tracing::debug!(hash, "result for finished transfer"),
                }
                return;
            }
        };
        match result {
            Ok(completion) => self.finish_reassembly(peer, kind, hash, completion),
            Err(FragmentError::UnknownTransfer(_)) => {
                tracing::trace!(hash, "check for finished transfer");
            }
            Err(err) => tracing::warn!(peer = %peer, transport = %kind, %err, "fragment rejected"),
        }
    }

    fn finish_reassembly(
        &self,
        peer: PeerHandle,
        kind: TransportKind,
        hash: u32,
        completion: Completion,
    ) {
        match completion {
            Completion::Done(body) => {
                tracing::debug!(peer = %peer, transport = %kind, len = body.len(), "fragmented message reassembled");
                self.send_fragment_control(
                    peer,
                    kind,
                    FragmentFrame::Result {
                        hash,
                        code: ResultCode::Ok,
                    },
                );
                match wire::decode(&body, 0) {
                    Ok(msg) => self.dispatch(peer, kind, msg),
                    Err(err) => {
                        tracing::warn!(peer = %peer, %err, "reassembled message does not decode");
                        self.mark_suspect(peer);
                    }
                }
            }
            Completion::Missing(missing) => {
                tracing::debug!(peer = %peer, transport = %kind, count = missing.len(), "asking for missing fragments");
                self.send_fragment_control(peer, kind, FragmentFrame::Resend { hash, missing });
            }
            Completion::Rejected(code) => {
                tracing::warn!(peer = %peer, transport = %kind, ?code, "fragmented transfer failed");
                self.send_fragment_control(peer, kind, FragmentFrame::Result { hash, code });
            }
        }
    }

    fn max_resend(&self, peer: PeerHandle, kind: TransportKind) -> usize {
        let Some(transport) = self.transports.get(&kind) else {
            return 0;
        };
        let prefix_len = self
            .peers
            .lock()
            .get(peer)
            .map_or(0, |p| self.prefix_for(p, kind, false).len());
        fragment::max_resend_indices(transport.max_frame_len(), prefix_len)
    }

    /// Send a resend or result frame straight to the driver.
    fn send_fragment_control(&self, peer: PeerHandle, kind: TransportKind, frame: FragmentFrame<'_>) {
        let Some(transport) = self.transports.get(&kind) else {
            return;
        };
        let Some((address, mut out)) = self
            .peers
            .lock()
            .get(peer)
            .map(|p| (p.address(), self.prefix_for(p, kind, false)))
        else {
            return;
        };
        out.extend_from_slice(&frame.encode());
        if let Err(err) = transport.send(&address, &out, false) {
            tracing::warn!(peer = %peer, transport = %kind, %err, "fragment control frame not sent");
        }
    }

    /// Answer a resend request, then ask the receiver to check again.
    fn resend_fragments(&self, hash: u32, missing: &[u32]) {
        let Some(t) = self.outgoing.lock().get(&hash).cloned() else {
            tracing::debug!(hash, "resend for finished transfer");
            return;
        };
        let Some(transport) = self.transports.get(&t.transport) else {
            return;
        };
        tracing::debug!(transport = %t.transport, count = missing.len(), "resending fragments");
        for &index in missing {
            if index >= t.header.count {
                tracing::warn!(index, "resend index out of range");
                continue;
            }
            if let Err(err) = transport.send(&t.address, &t.data_frame(index), false) {
                tracing::warn!(transport = %t.transport, %err, "resend failed");
                t.outcome.complete(Err(FragmentError::Failed));
                return;
            }
        }
        if let Err(err) = transport.send(&t.address, &t.check_frame(), false) {
            tracing::debug!(transport = %t.transport, %err, "check frame not sent");
        }
    }

    /// Drain every driver's receive buffer on the calling thread.
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        for (&kind, transport) in &self.transports {
            while let Some(frame) = transport.poll() {
                self.handle_frame(kind, frame);
                handled += 1;
            }
        }
        handled
    }

    /// Spawn a send worker and a poller per transport.
    pub fn start(self: &Arc<Self>) -> Result<(), NetError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut threads = self.threads.lock();
        for &kind in self.transports.keys() {
            let worker = Arc::clone(self);
            let poller = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("send-{kind}"))
                .spawn(move || worker.run_worker(kind))
                .and_then(|w| {
                    threads.push(w);
                    thread::Builder::new()
                        .name(format!("poll-{kind}"))
                        .spawn(move || poller.run_poller(kind))
                });
            match spawned {
                Ok(p) => threads.push(p),
                Err(err) => {
                    drop(threads);
                    self.shutdown();
                    return Err(NetError::Thread(err.to_string()));
                }
            }
        }
        tracing::info!(
            name = %self.host.name,
            mac = %self.host.mac,
            transports = self.transports.len(),
            "network started"
        );
        Ok(())
    }

    fn run_worker(&self, kind: TransportKind) {
        let Some(queue) = self.queues.get(&kind) else {
            return;
        };
        while self.is_running() {
            if let Some(item) = queue.pop(WORKER_WAIT) {
                self.process_item(kind, item);
            }
        }
    }

    fn run_poller(&self, kind: TransportKind) {
        let Some(transport) = self.transports.get(&kind) else {
            return;
        };
        while self.is_running() {
            match transport.poll() {
                Some(frame) => self.handle_frame(kind, frame),
                None => thread::sleep(POLL_IDLE),
            }
        }
    }

    /// Stop the threads, fail whatever is still queued and shut services down.
    /// Must not be called from a service or observer callback.
    pub fn shutdown(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        for queue in self.queues.values() {
            queue.drain(NetError::ShutDown);
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            if t.join().is_err() {
                tracing::error!("network thread panicked");
            }
        }
        for queue in self.queues.values() {
            queue.drain(NetError::ShutDown);
        }
        for t in self.outgoing.lock().values() {
            t.outcome.complete(Err(FragmentError::Failed));
        }
        self.services.write().shutdown_all();
        self.peers_changed.notify_all();
        if was_running {
            tracing::info!(name = %self.host.name, "network stopped");
        }
    }

    /// Evaluate every tracked transport of every peer. Returns the blocking
    /// work to do next; observers have already been told about state changes.
    pub fn check_health(&self) -> Vec<HealthAction> {
        let now = self.now();
        let host = self.host_transports();
        let mut changes = Vec::new();
        let mut actions = Vec::new();
        {
            let mut peers = self.peers.lock();
            for peer in peers.iter_mut() {
                if peer.state == PeerState::Banned {
                    continue;
                }
                let kinds = peer.tracked().intersection(host);
                if peer.state == PeerState::Unknown && !peer.mac.is_zero() && !kinds.is_empty() {
                    actions.push(HealthAction::Present {
                        peer: peer.handle,
                        transports: kinds,
                    });
                }
                for kind in kinds.iter() {
                    let out = health::check_transport(peer, kind, now, &self.timings);
                    changes.extend(out.changes);
                    if out.recover {
                        actions.push(HealthAction::Recover {
                            peer: peer.handle,
                            transport: kind,
                        });
                    }
                }
            }
        }
        let expired = self
            .reassembler
            .lock()
            .gc(now, self.config.fragment_timeout_ms);
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "stale fragmented transfers dropped");
        }
        self.notify_changes(&changes);
        actions
    }

    pub fn run_health_actions(&self, actions: Vec<HealthAction>) {
        for action in actions {
            match action {
                HealthAction::Present { peer, transports } => {
                    if let Err(err) = self.send_presentation(
                        peer,
                        transports,
                        false,
                        PresentationReason::Recover,
                    ) {
                        tracing::debug!(peer = %peer, %err, "presentation to unknown peer failed");
                    }
                }
                HealthAction::Recover { peer, transport } => self.recover(peer, transport),
            }
        }
    }

    /// One round of health checking, including the blocking follow-ups.
    pub fn tick_health(&self) {
        let actions = self.check_health();
        self.run_health_actions(actions);
    }

    /// Try to bring a recovering transport back. If every transport shared with
    /// the peer is in trouble the peer may have lost us entirely, so present
    /// again; otherwise a recovery heartbeat is enough.
    pub fn recover(&self, peer: PeerHandle, kind: TransportKind) {
        let now = self.now();
        let all_troubled = {
            let mut peers = self.peers.lock();
            let Some(p) = peers.get_mut(peer) else {
                return;
            };
            if !p.state.is_known() {
                return;
            }
            let Some(h) = p.health_mut(kind) else {
                return;
            };
            h.postpone = true;
            let shared = p.tracked().intersection(self.host_transports());
            shared.is_subset(p.problematic)
        };
        tracing::info!(peer = %peer, transport = %kind, all_troubled, "recovering transport");

        let mut recovered = false;
        if all_troubled {
            let presented =
                self.send_presentation(peer, kind.into(), false, PresentationReason::Recover);
            let mut out = CheckOutcome::default();
            {
                let now = self.now();
                let mut peers = self.peers.lock();
                if let Some(p) = peers.get_mut(peer) {
                    match &presented {
                        Ok(()) => {
                            if let Some(h) = p.health_mut(kind) {
                                h.failed_recoveries = 0;
                            }
                            out.changes.extend(p.set_health_state(
                                kind,
                                HealthState::Working,
                                Problem::None,
                                now,
                            ));
                            recovered = true;
                        }
                        Err(err) => {
                            tracing::warn!(peer = %p.name, transport = %kind, %err, "recovery presentation failed");
                            let problem = p.health(kind).map_or(Problem::Unknown, |h| h.problem);
                            health::record_failed_recovery(
                                p,
                                kind,
                                problem,
                                now,
                                &self.timings,
                                &mut out,
                            );
                        }
                    }
                }
            }
            self.notify_changes(&out.changes);
        }

        let delta = {
            let mut peers = self.peers.lock();
            let Some(h) = peers.get_mut(peer).and_then(|p| p.health_mut(kind)) else {
                return;
            };
            h.postpone = false;
            encode_delta(h.last_receive, now)
        };
        if !recovered {
            self.queue_heartbeat(peer, kind, ItemKind::Recovery, delta);
        }
    }

    /// Fold send counters into each transport's failure rate and cache scores.
    pub fn refresh_scores(&self) {
        let now = self.now();
        let mut peers = self.peers.lock();
        for peer in peers.iter_mut() {
            for kind in peer.tracked().iter() {
                if let Some(h) = peer.health_mut(kind) {
                    scoring::refresh_failure_rate(h);
                    h.last_score = scoring::score(h, kind, 0);
                    h.last_score_time = now;
                }
            }
        }
    }
}
