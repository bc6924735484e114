//! Reliable send pipeline: per-transport FIFO queues drained by worker threads,
//! bounded retries, failover to the next best transport, and a result slot
//! the caller blocks on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::NetError;
use crate::fragment::{self, FragmentError, OutgoingTransfer};
use crate::health::{HealthState, Problem};
use crate::network::Network;
use crate::peer::{PeerHandle, PeerState};
use crate::protocol::{MessageKind, PresentationReason};
use crate::scoring;
use crate::transport::{LinkError, PeerAddress, Transport, TransportKind, TransportSet};
use crate::wire::{self, Message};

/// Delivery attempts on one transport when a receipt is required.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Bound on how many times one logical send may move to another transport.
pub const MAX_FAILOVER_DEPTH: u32 = TransportKind::ALL.len() as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Normal,
    Heartbeat,
    /// Traffic generated by a recovery; allowed on a recovering transport.
    Recovery,
    /// Always uses MAC addressing; never retried or failed over.
    Presentation,
}

/// Final outcome of one logical send: the transport that delivered it.
pub type SendOutcome = Result<TransportKind, NetError>;

/// A one-shot value handed from a worker to whoever waits for it.
pub struct ResultSlot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Store the outcome. Only the first completion counts.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.ready.notify_all();
        true
    }
}

impl<T: Clone> ResultSlot<T> {
    /// Block until completed or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.value.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }

    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued send. The encoded body excludes the transport prefix, which is
/// added when the item is attempted.
pub struct WorkItem {
    pub peer: PeerHandle,
    pub kind: ItemKind,
    pub body: Vec<u8>,
    pub receipt: bool,
    /// Caller chose the transport; never fail over.
    pub forced: bool,
    pub excluded: TransportSet,
    pub depth: u32,
    pub outcome: Arc<ResultSlot<SendOutcome>>,
}

impl WorkItem {
    pub fn new(peer: PeerHandle, kind: ItemKind, body: Vec<u8>) -> Self {
        Self {
            peer,
            kind,
            body,
            receipt: false,
            forced: false,
            excluded: TransportSet::empty(),
            depth: 0,
            outcome: Arc::new(ResultSlot::new()),
        }
    }

    fn fails_over(&self) -> bool {
        self.kind == ItemKind::Normal && self.receipt && !self.forced
    }
}

/// Bounded FIFO of one transport.
pub struct SendQueue {
    items: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Append an item. A full queue resolves the item with `QueueFull`.
    pub fn push(&self, item: WorkItem) -> Result<(), NetError> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            item.outcome.complete(Err(NetError::QueueFull));
            return Err(NetError::QueueFull);
        }
        items.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    /// Oldest item, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<WorkItem> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    pub fn try_pop(&self) -> Option<WorkItem> {
        self.items.lock().pop_front()
    }

    /// Resolve everything still queued with `err`.
    pub fn drain(&self, err: NetError) {
        let drained: Vec<WorkItem> = self.items.lock().drain(..).collect();
        for item in drained {
            item.outcome.complete(Err(err.clone()));
        }
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Per-call send options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Require the peer to acknowledge delivery. Enables retries and failover.
    pub receipt: bool,
    /// Use exactly this transport.
    pub transport: Option<TransportKind>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            receipt: true,
            transport: None,
        }
    }
}

impl Network {
    /// Send `payload` to `peer` as a plain binary message and wait for the outcome.
    pub fn send(
        &self,
        peer: PeerHandle,
        payload: &[u8],
        receipt: bool,
    ) -> Result<TransportKind, NetError> {
        let msg = Message::binary(MessageKind::Message, payload);
        self.send_message(
            peer,
            msg,
            SendOptions {
                receipt,
                transport: None,
            },
        )
    }

    /// Send `msg` to `peer`, presenting first if the peer is unknown, and block
    /// until it is delivered, fails on every usable transport, or times out.
    pub fn send_message(
        &self,
        peer: PeerHandle,
        msg: Message,
        opts: SendOptions,
    ) -> Result<TransportKind, NetError> {
        if !self.is_running() {
            return Err(NetError::ShutDown);
        }
        self.ensure_presented(peer)?;
        let body = wire::encode(&msg, self.config.checksum)?;
        let kind = self.choose_transport(peer, body.len(), opts.transport)?;

        let mut item = WorkItem::new(peer, ItemKind::Normal, body);
        item.receipt = opts.receipt;
        item.forced = opts.transport.is_some();
        let outcome = item.outcome.clone();
        self.enqueue(kind, item)?;
        outcome
            .wait(Duration::from_millis(self.config.send_timeout_ms))
            .unwrap_or(Err(NetError::Timeout))
    }

    fn ensure_presented(&self, peer: PeerHandle) -> Result<(), NetError> {
        let state = self
            .peers
            .lock()
            .get(peer)
            .map(|p| p.state)
            .ok_or(NetError::PeerNotFound)?;
        match state {
            PeerState::Unknown => self.send_presentation(
                peer,
                self.host_transports(),
                false,
                PresentationReason::Add,
            ),
            PeerState::Presenting => self.wait_known(
                peer,
                Duration::from_millis(self.config.presentation_timeout_ms),
            ),
            PeerState::Banned => Err(NetError::PeerBanned),
            _ => Ok(()),
        }
    }

    fn choose_transport(
        &self,
        peer: PeerHandle,
        len: usize,
        forced: Option<TransportKind>,
    ) -> Result<TransportKind, NetError> {
        let now = self.now();
        let mut peers = self.peers.lock();
        let p = peers.get_mut(peer).ok_or(NetError::PeerNotFound)?;
        match forced {
            Some(kind) if self.transports.contains_key(&kind) && p.tracked().contains(kind) => {
                Ok(kind)
            }
            Some(kind) => Err(NetError::UnsupportedTransport(kind)),
            None => scoring::select(
                p,
                self.host_transports(),
                len,
                TransportSet::empty(),
                self.config.acceptable_score,
                now,
            ),
        }
    }

    /// Queue an item on a transport. On error the item's outcome is resolved too.
    pub fn enqueue(&self, kind: TransportKind, item: WorkItem) -> Result<(), NetError> {
        let Some(queue) = self.queues.get(&kind) else {
            let err = NetError::UnsupportedTransport(kind);
            item.outcome.complete(Err(err.clone()));
            return Err(err);
        };
        queue.push(item)
    }

    /// Attempt the oldest item of `kind`'s queue on the calling thread.
    /// Returns false if the queue was empty.
    pub fn process_next(&self, kind: TransportKind) -> bool {
        let Some(item) = self.queues.get(&kind).and_then(SendQueue::try_pop) else {
            return false;
        };
        self.process_item(kind, item);
        true
    }

    pub(crate) fn process_item(&self, kind: TransportKind, item: WorkItem) {
        let result = self.attempt(kind, &item);
        match result {
            Ok(()) => {
                item.outcome.complete(Ok(kind));
            }
            Err(err) if item.fails_over() && !err.is_who() => self.fail_over(kind, item, err),
            Err(err) => {
                item.outcome.complete(Err(err));
            }
        }
    }

    fn attempt(&self, kind: TransportKind, item: &WorkItem) -> Result<(), NetError> {
        let transport = self
            .transports
            .get(&kind)
            .ok_or(NetError::UnsupportedTransport(kind))?;
        let (address, prefix) = {
            let peers = self.peers.lock();
            let p = peers.get(item.peer).ok_or(NetError::PeerNotFound)?;
            if p.state == PeerState::Banned {
                return Err(NetError::PeerBanned);
            }
            if item.kind == ItemKind::Normal
                && p.health(kind).is_some_and(|h| h.state >= HealthState::Recovering)
            {
                return Err(NetError::Recovering);
            }
            (
                p.address(),
                self.prefix_for(p, kind, item.kind == ItemKind::Presentation),
            )
        };

        let (result, failures) = if prefix.len() + item.body.len() > transport.max_frame_len() {
            if item.kind != ItemKind::Normal {
                return Err(NetError::MessageTooLong);
            }
            let r = self.send_fragmented(
                kind,
                transport.as_ref(),
                item.peer,
                address,
                prefix,
                item.body.clone(),
            );
            let failures = u32::from(r.is_err());
            (r, failures)
        } else {
            let mut frame = prefix;
            frame.extend_from_slice(&item.body);
            deliver(transport.as_ref(), &address, &frame, item.receipt)
        };
        self.after_send(kind, item, &result, failures);
        result
    }

    /// Fold a send result into the peer's health and notify observers.
    fn after_send(
        &self,
        kind: TransportKind,
        item: &WorkItem,
        result: &Result<(), NetError>,
        failures: u32,
    ) {
        let now = self.now();
        let mut changes = Vec::new();
        let mut peer_reset = false;
        {
            let mut peers = self.peers.lock();
            let Some(p) = peers.get_mut(item.peer) else {
                return;
            };
            if let Some(h) = p.health_mut(kind) {
                for _ in 0..failures {
                    h.record_send(false, now);
                }
                if result.is_ok() {
                    h.record_send(true, now);
                    if item.receipt {
                        h.record_peer_receive(now);
                    }
                }
            }
            match result {
                Ok(()) if item.receipt => {
                    if p.health(kind).map(|h| h.state) == Some(HealthState::Initiating) {
                        changes.extend(p.set_health_state(
                            kind,
                            HealthState::Working,
                            Problem::None,
                            now,
                        ));
                    }
                }
                Err(NetError::Link(LinkError::Who)) => {
                    tracing::warn!(peer = %p.name, transport = %kind, "peer does not recognize us, will present again");
                    p.state = PeerState::Unknown;
                    peer_reset = true;
                }
                Err(NetError::Link(LinkError::Unavailable)) => {
                    changes.extend(p.set_health_state(
                        kind,
                        HealthState::Problem,
                        Problem::Technical,
                        now,
                    ));
                }
                Err(err) => {
                    tracing::warn!(peer = %p.name, transport = %kind, %err, "send failed");
                }
                Ok(()) => {}
            }
        }
        if peer_reset {
            self.peers_changed.notify_all();
        }
        self.notify_changes(&changes);
        if result.is_ok() && matches!(item.kind, ItemKind::Normal | ItemKind::Presentation) {
            self.notify_send_activity(item.peer, kind);
        }
    }

    /// Move a failed item to the best remaining transport, or resolve it with `err`.
    fn fail_over(&self, failed: TransportKind, mut item: WorkItem, err: NetError) {
        item.excluded.insert(failed);
        item.depth += 1;
        if item.depth >= MAX_FAILOVER_DEPTH {
            tracing::warn!(depth = item.depth, "failover depth exhausted");
            item.outcome.complete(Err(err));
            return;
        }
        let now = self.now();
        let next = {
            let mut peers = self.peers.lock();
            match peers.get_mut(item.peer) {
                Some(p) => scoring::select(
                    p,
                    self.host_transports(),
                    item.body.len(),
                    item.excluded,
                    self.config.acceptable_score,
                    now,
                ),
                None => Err(NetError::PeerNotFound),
            }
        };
        match next {
            Ok(next) => {
                tracing::info!(from = %failed, to = %next, %err, "failing over");
                // enqueue resolves the outcome itself on failure
                let _ = self.enqueue(next, item);
            }
            Err(_) => {
                tracing::warn!(transport = %failed, %err, "no transport left to fail over to");
                item.outcome.complete(Err(err));
            }
        }
    }

    /// Stream `body` as fragments and wait for the receiver's verdict.
    fn send_fragmented(
        &self,
        kind: TransportKind,
        transport: &dyn Transport,
        peer: PeerHandle,
        address: PeerAddress,
        prefix: Vec<u8>,
        body: Vec<u8>,
    ) -> Result<(), NetError> {
        let size = fragment::fragment_size(transport.max_frame_len(), prefix.len())?;
        let transfer = Arc::new(OutgoingTransfer::new(
            peer, kind, address, prefix, body, size,
        ));
        let hash = transfer.header.hash;
        tracing::debug!(
            transport = %kind,
            len = transfer.header.total_len,
            count = transfer.header.count,
            "sending fragmented"
        );
        self.outgoing.lock().insert(hash, transfer.clone());
        let result = self.stream_fragments(transport, &transfer);
        self.outgoing.lock().remove(&hash);
        result
    }

    fn stream_fragments(
        &self,
        transport: &dyn Transport,
        t: &OutgoingTransfer,
    ) -> Result<(), NetError> {
        self.postpone(t.peer, t.transport);
        transport.send(&t.address, &t.init_frame(), true)?;
        for index in 0..t.header.count {
            transport.send(&t.address, &t.data_frame(index), false)?;
        }
        transport.send(&t.address, &t.check_frame(), false)?;
        match t
            .outcome
            .wait(Duration::from_millis(self.config.fragment_timeout_ms))
        {
            Some(r) => r.map_err(NetError::from),
            None => Err(FragmentError::Timeout.into()),
        }
    }
}

/// Hand one frame to a driver, retrying up to `MAX_SEND_ATTEMPTS` times when a
/// receipt is required. Returns the result and the number of failed attempts.
fn deliver(
    transport: &dyn Transport,
    address: &PeerAddress,
    frame: &[u8],
    receipt: bool,
) -> (Result<(), NetError>, u32) {
    let attempts = if receipt { MAX_SEND_ATTEMPTS } else { 1 };
    let mut failures = 0;
    let mut last = LinkError::SendFailed;
    for attempt in 1..=attempts {
        match transport.send(address, frame, receipt) {
            Ok(()) => return (Ok(()), failures),
            Err(e) => {
                failures += 1;
                last = e;
                tracing::debug!(transport = %transport.kind(), attempt, error = %e, "send attempt failed");
                if matches!(e, LinkError::Who | LinkError::Unavailable | LinkError::TooLong) {
                    break;
                }
            }
        }
    }
    (Err(last.into()), failures)
}
