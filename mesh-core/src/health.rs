//! Transport health: per (peer, transport) record and the state machine that
//! moves it between `Initiating`, `Working`, `Problem`, `Recovering` and `Down`.

use std::fmt;

use crate::config::NetConfig;
use crate::peer::{Peer, PeerHandle, PeerState};
use crate::scoring::FAILURE_RATE_HISTORY_LEN;
use crate::transport::{TransportKind, TransportSet};

/// Checks are skipped until the node has been up this long past one heartbeat interval.
const BOOT_GRACE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthState {
    Initiating,
    Working,
    Problem,
    Recovering,
    Down,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthState::Initiating => "initiating",
            HealthState::Working => "working",
            HealthState::Problem => "problem",
            HealthState::Recovering => "recovering",
            HealthState::Down => "down",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Problem {
    None,
    SendFailure,
    Silence,
    Unreachable,
    Technical,
    Unknown,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Problem::None => "none",
            Problem::SendFailure => "send failure",
            Problem::Silence => "silence",
            Problem::Unreachable => "unreachable",
            Problem::Technical => "technical",
            Problem::Unknown => "unknown",
        })
    }
}

/// Health of one transport towards one peer. Timestamps are clock milliseconds,
/// zero meaning never.
#[derive(Debug, Clone)]
pub struct TransportHealth {
    pub state: HealthState,
    pub problem: Problem,
    pub last_state_change: u64,
    /// Last successful send.
    pub last_send: u64,
    /// Last successful receive from the peer.
    pub last_receive: u64,
    /// Last time the peer is believed to have received from us.
    pub last_peer_receive: u64,
    pub last_sent_heartbeat: u64,
    /// Suppresses health evaluation once, e.g. during bulk transfers.
    pub postpone: bool,
    pub send_successes: u32,
    pub send_failures: u32,
    pub receive_successes: u32,
    pub receive_failures: u32,
    pub crc_mismatches: u32,
    pub failure_rate: f32,
    pub failure_rate_history: [f32; FAILURE_RATE_HISTORY_LEN],
    pub last_score: f32,
    pub last_score_time: u64,
    /// Consecutive recoveries that did not bring the transport back.
    pub failed_recoveries: u32,
}

impl TransportHealth {
    pub fn new(now: u64) -> Self {
        let mut h = Self {
            state: HealthState::Initiating,
            problem: Problem::None,
            last_state_change: now,
            last_send: 0,
            last_receive: 0,
            last_peer_receive: 0,
            last_sent_heartbeat: 0,
            postpone: false,
            send_successes: 0,
            send_failures: 0,
            receive_successes: 0,
            receive_failures: 0,
            crc_mismatches: 0,
            failure_rate: 0.0,
            failure_rate_history: [0.0; FAILURE_RATE_HISTORY_LEN],
            last_score: 0.0,
            last_score_time: 0,
            failed_recoveries: 0,
        };
        h.reset_stats(now);
        h
    }

    pub fn reset_stats(&mut self, now: u64) {
        self.send_successes = 0;
        self.send_failures = 0;
        self.receive_successes = 0;
        self.receive_failures = 0;
        self.crc_mismatches = 0;
        self.last_send = now;
        self.last_receive = now;
        self.last_peer_receive = now;
        self.postpone = false;
    }

    pub fn record_send(&mut self, ok: bool, now: u64) {
        if ok {
            self.send_successes = self.send_successes.saturating_add(1);
            self.last_send = now;
        } else {
            self.send_failures = self.send_failures.saturating_add(1);
        }
    }

    pub fn record_receive(&mut self, ok: bool, now: u64) {
        if ok {
            self.receive_successes = self.receive_successes.saturating_add(1);
            self.last_receive = now;
        } else {
            self.receive_failures = self.receive_failures.saturating_add(1);
        }
    }

    /// Evidence that the peer heard from us at `at`. Never moves backwards.
    pub fn record_peer_receive(&mut self, at: u64) {
        if at > self.last_peer_receive {
            self.last_peer_receive = at;
        }
    }
}

/// Notification of an actual health transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub peer: PeerHandle,
    pub peer_name: String,
    pub transport: TransportKind,
    pub from: HealthState,
    pub to: HealthState,
    pub previous_problem: Problem,
    pub problem: Problem,
}

/// Work the periodic check asks the host to carry out. These may block, so
/// they are returned rather than run under the peer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Peer is unknown to us: present on these transports.
    Present {
        peer: PeerHandle,
        transports: TransportSet,
    },
    /// Transport just entered `Recovering`.
    Recover {
        peer: PeerHandle,
        transport: TransportKind,
    },
}

/// Thresholds derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosTimings {
    pub heartbeat_interval_ms: u64,
    pub idle_margin_ms: u64,
    pub problem_margin_ms: u64,
    pub heard_from_limit_ms: u64,
    pub max_recovery_attempts: u32,
}

impl QosTimings {
    pub fn from_config(c: &NetConfig) -> Self {
        Self {
            heartbeat_interval_ms: c.heartbeat_interval_ms,
            idle_margin_ms: c.heartbeat_interval_ms + 100,
            problem_margin_ms: c.problem_heartbeat_ms,
            heard_from_limit_ms: c.heartbeat_interval_ms * c.heard_from_multiplier,
            max_recovery_attempts: c.max_recovery_attempts,
        }
    }
}

/// Outcome of checking one transport.
#[derive(Debug, Default)]
pub struct CheckOutcome {
    pub changes: Vec<StateChange>,
    pub recover: bool,
}

/// Evaluate one transport of `peer`. Calling this again with no new evidence
/// produces no further changes.
pub fn check_transport(
    peer: &mut Peer,
    kind: TransportKind,
    now: u64,
    t: &QosTimings,
) -> CheckOutcome {
    let mut out = CheckOutcome::default();
    if now < t.heartbeat_interval_ms + BOOT_GRACE_MS {
        return out;
    }
    let peer_state = peer.state;
    let Some(h) = peer.health_mut(kind) else {
        return out;
    };
    if h.postpone {
        h.last_send = now;
        h.last_receive = now;
        h.last_peer_receive = now;
        h.postpone = false;
        return out;
    }

    let limit = now.saturating_sub(t.heard_from_limit_ms);
    let state = h.state;
    let heard_recently = h.last_receive >= limit;

    match state {
        HealthState::Initiating | HealthState::Working | HealthState::Problem => {
            let verdict = if h.last_send < limit {
                Some(Problem::SendFailure)
            } else if h.last_receive < limit {
                Some(Problem::Silence)
            } else if h.last_peer_receive > 0 && h.last_peer_receive < limit {
                Some(Problem::Unreachable)
            } else {
                None
            };
            let next = match verdict {
                Some(problem) => Some((HealthState::Problem, problem)),
                None if state != HealthState::Working && peer_state != PeerState::Unknown => {
                    Some((HealthState::Working, Problem::None))
                }
                None => None,
            };
            if let Some((s, p)) = next {
                push(&mut out, peer.set_health_state(kind, s, p, now));
            }
            if let Some(h) = peer.health(kind) {
                if h.state == HealthState::Problem
                    && now.saturating_sub(h.last_state_change) >= t.heartbeat_interval_ms
                {
                    let problem = h.problem;
                    push(
                        &mut out,
                        peer.set_health_state(kind, HealthState::Recovering, problem, now),
                    );
                    out.recover = true;
                }
            }
        }
        HealthState::Recovering => {
            if heard_recently {
                recovered(peer, kind, now, &mut out);
            } else if now.saturating_sub(h.last_state_change) >= t.heard_from_limit_ms {
                let problem = h.problem;
                record_failed_recovery(peer, kind, problem, now, t, &mut out);
            }
        }
        HealthState::Down => {
            if heard_recently {
                recovered(peer, kind, now, &mut out);
            }
        }
    }
    out
}

/// A recovery attempt did not bring the transport back: fall back to `Problem`,
/// or `Down` once attempts are exhausted.
pub fn record_failed_recovery(
    peer: &mut Peer,
    kind: TransportKind,
    problem: Problem,
    now: u64,
    t: &QosTimings,
    out: &mut CheckOutcome,
) {
    let Some(h) = peer.health_mut(kind) else {
        return;
    };
    h.failed_recoveries += 1;
    let next = if h.failed_recoveries >= t.max_recovery_attempts {
        HealthState::Down
    } else {
        HealthState::Problem
    };
    push(out, peer.set_health_state(kind, next, problem, now));
}

fn recovered(peer: &mut Peer, kind: TransportKind, now: u64, out: &mut CheckOutcome) {
    if let Some(h) = peer.health_mut(kind) {
        h.failed_recoveries = 0;
    }
    push(
        out,
        peer.set_health_state(kind, HealthState::Working, Problem::None, now),
    );
}

fn push(out: &mut CheckOutcome, change: Option<StateChange>) {
    if let Some(c) = change {
        out.changes.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerTable;

    const HB: u64 = 1_000;

    fn timings() -> QosTimings {
        QosTimings {
            heartbeat_interval_ms: HB,
            idle_margin_ms: HB + 100,
            problem_margin_ms: 250,
            heard_from_limit_ms: HB * 6,
            max_recovery_attempts: 3,
        }
    }

    fn known_peer(table: &mut PeerTable, now: u64) -> PeerHandle {
        let h = table.add("remote").unwrap();
        let p = table.get_mut(h).unwrap();
        p.state = PeerState::KnownInsecure;
        p.track(TransportKind::Lora.into(), now);
        p.set_health_state(TransportKind::Lora, HealthState::Working, Problem::None, now);
        h
    }

    fn state(table: &PeerTable, h: PeerHandle) -> (HealthState, Problem) {
        let health = table.get(h).unwrap().health(TransportKind::Lora).unwrap();
        (health.state, health.problem)
    }

    #[test]
    fn initiating_becomes_working_for_known_peer() {
        let mut t = PeerTable::new();
        let h = t.add("remote").unwrap();
        let p = t.get_mut(h).unwrap();
        p.state = PeerState::KnownInsecure;
        p.track(TransportKind::Lora.into(), 10_000);
        let out = check_transport(p, TransportKind::Lora, 10_500, &timings());
        assert_eq!(out.changes.len(), 1);
        assert_eq!(out.changes[0].to, HealthState::Working);
    }

    #[test]
    fn unknown_peer_does_not_self_heal() {
        let mut t = PeerTable::new();
        let h = t.add("remote").unwrap();
        let p = t.get_mut(h).unwrap();
        p.track(TransportKind::Lora.into(), 10_000);
        let out = check_transport(p, TransportKind::Lora, 10_500, &timings());
        assert!(out.changes.is_empty());
    }

    #[test]
    fn boot_grace_skips_checks() {
        let mut t = PeerTable::new();
        let h = known_peer(&mut t, 0);
        let p = t.get_mut(h).unwrap();
        p.health_mut(TransportKind::Lora).unwrap().last_receive = 0;
        let out = check_transport(p, TransportKind::Lora, HB, &timings());
        assert!(out.changes.is_empty());
    }

    #[test]
    fn problem_priority_send_then_silence_then_unreachable() {
        let t0 = 20_000;
        let now = t0 + HB * 7;
        let mut t = PeerTable::new();
        let h = known_peer(&mut t, t0);
        let p = t.get_mut(h).unwrap();

        check_transport(p, TransportKind::Lora, now, &timings());
        assert_eq!(state(&t, h), (HealthState::Problem, Problem::SendFailure));

        let p = t.get_mut(h).unwrap();
        p.health_mut(TransportKind::Lora).unwrap().last_send = now;
        check_transport(p, TransportKind::Lora, now, &timings());
        assert_eq!(state(&t, h), (HealthState::Problem, Problem::Silence));

        let p = t.get_mut(h).unwrap();
        p.health_mut(TransportKind::Lora).unwrap().last_receive = now;
        check_transport(p, TransportKind::Lora, now, &timings());
        assert_eq!(state(&t, h), (HealthState::Problem, Problem::Unreachable));

        let p = t.get_mut(h).unwrap();
        p.health_mut(TransportKind::Lora).unwrap().last_peer_receive = now;
        check_transport(p, TransportKind::Lora, now, &timings());
        assert_eq!(state(&t, h), (HealthState::Working, Problem::None));
    }

    #[test]
    fn repeated_check_without_evidence_is_idempotent() {
        let t0 = 20_000;
        let now = t0 + HB * 7;
        let mut t = PeerTable::new();
        let h = known_peer(&mut t, t0);
        let p = t.get_mut(h).unwrap();
        let first = check_transport(p, TransportKind::Lora, now, &timings());
        let second = check_transport(p, TransportKind::Lora, now, &timings());
        assert_eq!(first.changes.len(), 1);
        assert!(second.changes.is_empty());
        assert!(!second.recover);
    }

    #[test]
    fn postpone_refreshes_and_skips() {
        let t0 = 20_000;
        let now = t0 + HB * 7;
        let mut t = PeerTable::new();
        let h = known_peer(&mut t, t0);
        let p = t.get_mut(h).unwrap();
        p.health_mut(TransportKind::Lora).unwrap().postpone = true;
        let out = check_transport(p, TransportKind::Lora, now, &timings());
        assert!(out.changes.is_empty());
        let health = p.health(TransportKind::Lora).unwrap();
        assert!(!health.postpone);
        assert_eq!(health.last_receive, now);
    }

    #[test]
    fn failed_recoveries_end_in_down_and_receive_revives() {
        let t0 = 20_000;
        let limit = HB * 6;
        let mut now = t0 + HB * 7;
        let mut t = PeerTable::new();
        let h = known_peer(&mut t, t0);
        {
            let p = t.get_mut(h).unwrap();
            let health = p.health_mut(TransportKind::Lora).unwrap();
            health.last_send = now;
            health.last_peer_receive = now;
        }
        for attempt in 1..=3 {
            let p = t.get_mut(h).unwrap();
            check_transport(p, TransportKind::Lora, now, &timings());
            assert_eq!(state(&t, h).0, HealthState::Problem);
            now += HB;
            let p = t.get_mut(h).unwrap();
            let h2 = p.health_mut(TransportKind::Lora).unwrap();
            h2.last_send = now;
            h2.last_peer_receive = now;
            let out = check_transport(p, TransportKind::Lora, now, &timings());
            assert!(out.recover);
            assert_eq!(state(&t, h).0, HealthState::Recovering);
            now += limit;
            let p = t.get_mut(h).unwrap();
            let h2 = p.health_mut(TransportKind::Lora).unwrap();
            h2.last_send = now;
            h2.last_peer_receive = now;
            check_transport(p, TransportKind::Lora, now, &timings());
            let expected = if attempt == 3 {
                HealthState::Down
            } else {
                HealthState::Problem
            };
            assert_eq!(state(&t, h).0, expected);
        }
        let p = t.get_mut(h).unwrap();
        check_transport(p, TransportKind::Lora, now + 1, &timings());
        assert_eq!(state(&t, h).0, HealthState::Down);

        let p = t.get_mut(h).unwrap();
        p.health_mut(TransportKind::Lora).unwrap().last_receive = now + 2;
        check_transport(p, TransportKind::Lora, now + 2, &timings());
        assert_eq!(state(&t, h), (HealthState::Working, Problem::None));
        assert_eq!(
            t.get(h).unwrap().health(TransportKind::Lora).unwrap().failed_recoveries,
            0
        );
    }
}
