//! Heartbeats: small one-way probes carrying how long ago the sender last
//! heard from the receiver, in tens of milliseconds. The receiver turns that
//! into "the peer heard from us at" without needing synchronized clocks.

use crate::health::{HealthState, QosTimings, TransportHealth};
use crate::network::Network;
use crate::peer::{PeerHandle, PeerState};
use crate::protocol::MessageKind;
use crate::send::{ItemKind, WorkItem};
use crate::transport::TransportKind;
use crate::wire::{self, Message};

pub const HEARTBEAT_PAYLOAD_LEN: usize = 2;

/// Milliseconds since `last_receive`, in tens of ms, saturating at `u16::MAX`.
pub fn encode_delta(last_receive: u64, now: u64) -> u16 {
    let tens = now.saturating_sub(last_receive) / 10;
    u16::try_from(tens).unwrap_or(u16::MAX)
}

/// When the peer last heard from us, given its delta.
pub fn peer_receive_at(delta: u16, now: u64) -> u64 {
    now.saturating_sub(u64::from(delta) * 10)
}

pub fn heartbeat_message(delta: u16) -> Message {
    Message::binary(MessageKind::Heartbeat, delta.to_le_bytes())
}

pub fn parse_heartbeat(msg: &Message) -> Option<u16> {
    if msg.kind != MessageKind::Heartbeat || msg.binary.len() != HEARTBEAT_PAYLOAD_LEN {
        return None;
    }
    Some(u16::from_le_bytes([msg.binary[0], msg.binary[1]]))
}

/// Whether a transport should be probed now.
pub fn heartbeat_due(h: &TransportHealth, now: u64, t: &QosTimings) -> bool {
    if h.postpone {
        return false;
    }
    let older = |ts: u64, margin: u64| ts < now.saturating_sub(margin);
    let idle = t.idle_margin_ms;
    let troubled = h.state > HealthState::Working;
    (troubled && older(h.last_send, t.problem_margin_ms))
        || (!troubled && older(h.last_send, idle))
        || older(h.last_receive, idle * 2)
        || older(h.last_peer_receive, idle * 2)
        || older(h.last_sent_heartbeat, idle * 3)
}

impl Network {
    /// Queue a heartbeat on every (peer, transport) pair that is due.
    /// Returns how many were queued.
    pub fn send_heartbeats(&self) -> usize {
        let now = self.now();
        let mut due: Vec<(PeerHandle, TransportKind, ItemKind, u16)> = Vec::new();
        {
            let mut peers = self.peers.lock();
            for peer in peers.iter_mut() {
                if !peer.state.is_known() {
                    continue;
                }
                let handle = peer.handle;
                for kind in peer.tracked().intersection(self.host_transports()).iter() {
                    let Some(h) = peer.health_mut(kind) else {
                        continue;
                    };
                    if !heartbeat_due(h, now, &self.timings) {
                        continue;
                    }
                    let item_kind = if h.state == HealthState::Recovering {
                        ItemKind::Recovery
                    } else {
                        ItemKind::Heartbeat
                    };
                    h.last_sent_heartbeat = now;
                    due.push((handle, kind, item_kind, encode_delta(h.last_receive, now)));
                }
            }
        }
        let mut queued = 0;
        for (peer, kind, item_kind, delta) in due {
            if self.queue_heartbeat(peer, kind, item_kind, delta) {
                queued += 1;
            }
        }
        queued
    }

    pub(crate) fn queue_heartbeat(
        &self,
        peer: PeerHandle,
        kind: TransportKind,
        item_kind: ItemKind,
        delta: u16,
    ) -> bool {
        let body = match wire::encode(&heartbeat_message(delta), self.config.checksum) {
            Ok(b) => b,
            Err(err) => {
                tracing::error!(%err, "could not encode heartbeat");
                return false;
            }
        };
        tracing::trace!(peer = %peer, transport = %kind, delta, "heartbeat");
        self.enqueue(kind, WorkItem::new(peer, item_kind, body)).is_ok()
    }

    /// Apply a received heartbeat: the peer heard from us `delta * 10` ms ago.
    pub(crate) fn handle_heartbeat(&self, peer: PeerHandle, kind: TransportKind, msg: &Message) {
        let Some(delta) = parse_heartbeat(msg) else {
            tracing::warn!(peer = %peer, transport = %kind, "malformed heartbeat");
            return;
        };
        let at = peer_receive_at(delta, self.now());
        let mut peers = self.peers.lock();
        if let Some(p) = peers.get_mut(peer) {
            if p.state == PeerState::Banned {
                return;
            }
            if let Some(h) = p.health_mut(kind) {
                h.record_peer_receive(at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;

    fn timings() -> QosTimings {
        QosTimings::from_config(&NetConfig {
            heartbeat_interval_ms: 1_000,
            problem_heartbeat_ms: 300,
            ..NetConfig::default()
        })
    }

    fn fresh(now: u64) -> TransportHealth {
        let mut h = TransportHealth::new(now);
        h.state = HealthState::Working;
        h.last_sent_heartbeat = now;
        h
    }

    #[test]
    fn delta_in_tens_of_ms_and_clamped() {
        assert_eq!(encode_delta(1_000, 1_259), 25);
        assert_eq!(encode_delta(0, 10_000_000), u16::MAX);
        assert_eq!(encode_delta(500, 400), 0);
        assert_eq!(peer_receive_at(25, 10_000), 9_750);
        assert_eq!(peer_receive_at(u16::MAX, 100), 0);
    }

    #[test]
    fn message_layout() {
        let msg = heartbeat_message(0x0102);
        let bytes = wire::encode(&msg, Default::default()).unwrap();
        assert_eq!(bytes[4], 0x43);
        assert_eq!(&bytes[5..], &[0x02, 0x01]);
        assert_eq!(parse_heartbeat(&wire::decode(&bytes, 0).unwrap()), Some(0x0102));
        assert_eq!(parse_heartbeat(&Message::binary(MessageKind::Heartbeat, vec![1])), None);
    }

    #[test]
    fn not_due_when_everything_is_fresh() {
        let t = timings();
        assert!(!heartbeat_due(&fresh(10_000), 10_500, &t));
    }

    #[test]
    fn due_when_idle() {
        let t = timings();
        let mut h = fresh(10_000);
        h.last_receive = 12_000;
        h.last_peer_receive = 12_000;
        h.last_sent_heartbeat = 12_000;
        assert!(!heartbeat_due(&h, 11_100, &t));
        assert!(heartbeat_due(&h, 11_101, &t));
    }

    #[test]
    fn problem_uses_short_margin() {
        let t = timings();
        let mut h = fresh(10_000);
        h.state = HealthState::Problem;
        assert!(heartbeat_due(&h, 10_301, &t));
        h.state = HealthState::Working;
        assert!(!heartbeat_due(&h, 10_301, &t));
    }

    #[test]
    fn due_on_silence_or_missing_evidence() {
        let t = timings();
        let now = 20_000;
        let mut h = fresh(now);
        h.last_receive = now - 2 * t.idle_margin_ms - 1;
        assert!(heartbeat_due(&h, now, &t));
        let mut h = fresh(now);
        h.last_peer_receive = now - 2 * t.idle_margin_ms - 1;
        assert!(heartbeat_due(&h, now, &t));
        let mut h = fresh(now);
        h.last_sent_heartbeat = now - 3 * t.idle_margin_ms - 1;
        assert!(heartbeat_due(&h, now, &t));
    }

    #[test]
    fn postpone_suppresses() {
        let t = timings();
        let mut h = fresh(0);
        h.postpone = true;
        assert!(!heartbeat_due(&h, 1_000_000, &t));
    }
}
