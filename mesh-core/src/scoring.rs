//! Scoring and selection: rank a peer's transports by payload-size fitness,
//! recent failure rate and current health; pick the best non-excluded one.

use crate::error::NetError;
use crate::health::{HealthState, TransportHealth};
use crate::peer::Peer;
use crate::transport::{TransportKind, TransportSet};

/// Length of the sliding failure-rate window.
pub const FAILURE_RATE_HISTORY_LEN: usize = 4;

/// Default lowest score a transport may have and still be selected.
pub const DEFAULT_ACCEPTABLE_SCORE: f32 = -40.0;

const SCORE_MIN: f32 = -100.0;
const SCORE_MAX: f32 = 100.0;
const PROBLEM_PENALTY: f32 = 25.0;
const NO_DATA_FAILURE_RATE: f32 = 0.1;
/// Counters are renormalized once their sum exceeds this.
const RENORMALIZE_ABOVE: u32 = 5;
/// Largest value a counter keeps after renormalization.
const RENORMALIZED_MAX: u32 = 4;

/// How well a payload of `len` bytes suits a transport, in `[0, 100]`.
/// Non-increasing in `len`.
pub fn size_fitness(kind: TransportKind, len: usize) -> f32 {
    let len = len as f32;
    let fitness = match kind {
        TransportKind::CanBus if len <= 8.0 => 100.0,
        TransportKind::CanBus => 80.0 - (len - 8.0) / 10.0,
        TransportKind::EspNow => 100.0,
        TransportKind::Ble | TransportKind::I2c => 90.0,
        TransportKind::Lora => 80.0 - len / 10.0,
        TransportKind::Mock => 50.0,
    };
    fitness.clamp(0.0, 100.0)
}

/// Failure rate implied by the raw counters.
pub fn observed_failure_rate(h: &TransportHealth) -> f32 {
    match (h.send_successes, h.send_failures) {
        (0, 0) => NO_DATA_FAILURE_RATE,
        (0, _) => 1.0,
        (s, f) => f as f32 / s as f32,
    }
}

/// Average `rate` with the window, then slide it into the window.
pub fn push_failure_rate(history: &mut [f32; FAILURE_RATE_HISTORY_LEN], rate: f32) -> f32 {
    let sum: f32 = history.iter().sum::<f32>() + rate;
    history.rotate_left(1);
    history[FAILURE_RATE_HISTORY_LEN - 1] = rate;
    sum / (FAILURE_RATE_HISTORY_LEN + 1) as f32
}

/// Shrink counters so their sum stays small while keeping which side dominates.
pub fn renormalize(successes: u32, failures: u32) -> (u32, u32) {
    if successes + failures <= RENORMALIZE_ABOVE {
        return (successes, failures);
    }
    if successes == failures {
        return (0, 0);
    }
    let max = RENORMALIZED_MAX as f32;
    if successes == 0 {
        return (0, RENORMALIZED_MAX);
    }
    let quotient = failures as f32 / successes as f32;
    if quotient >= max {
        (0, RENORMALIZED_MAX)
    } else if quotient <= 1.0 / max {
        (RENORMALIZED_MAX, 0)
    } else if quotient > 1.0 {
        ((max / quotient).round() as u32, RENORMALIZED_MAX)
    } else {
        (RENORMALIZED_MAX, (max * quotient).round() as u32)
    }
}

/// Periodic refresh: fold the counters into the window and renormalize them.
pub fn refresh_failure_rate(h: &mut TransportHealth) {
    let rate = observed_failure_rate(h);
    h.failure_rate = push_failure_rate(&mut h.failure_rate_history, rate);
    let (s, f) = renormalize(h.send_successes, h.send_failures);
    h.send_successes = s;
    h.send_failures = f;
}

/// Suitability of a transport for a payload, in `[-100, 100]`.
pub fn score(h: &TransportHealth, kind: TransportKind, payload_len: usize) -> f32 {
    let reliability = (10.0 - h.failure_rate * 100.0).max(SCORE_MIN);
    let penalty = if h.state == HealthState::Problem {
        PROBLEM_PENALTY
    } else {
        0.0
    };
    (size_fitness(kind, payload_len) + reliability - penalty).clamp(SCORE_MIN, SCORE_MAX)
}

/// Pick the best transport among `candidates` the peer tracks, skipping
/// `excluded` and anything `Recovering` or worse. Caches each computed score.
pub fn select(
    peer: &mut Peer,
    candidates: TransportSet,
    payload_len: usize,
    excluded: TransportSet,
    acceptable: f32,
    now: u64,
) -> Result<TransportKind, NetError> {
    let mut best: Option<(TransportKind, f32)> = None;
    for kind in candidates.intersection(peer.tracked()).difference(excluded).iter() {
        let Some(h) = peer.health_mut(kind) else {
            continue;
        };
        if h.state >= HealthState::Recovering {
            continue;
        }
        let s = score(h, kind, payload_len);
        h.last_score = s;
        h.last_score_time = now;
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((kind, s));
        }
    }
    match best {
        Some((kind, s)) if s >= acceptable => Ok(kind),
        Some((kind, s)) => {
            tracing::warn!(peer = %peer.name, transport = %kind, score = s, "best transport below acceptable score");
            Err(NetError::NoSuitableTransport)
        }
        None => Err(NetError::NoSuitableTransport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Problem;
    use crate::peer::PeerTable;

    fn peer_with(table: &mut PeerTable, kinds: &[TransportKind]) -> crate::peer::PeerHandle {
        let h = table.add("p").unwrap();
        let p = table.get_mut(h).unwrap();
        let set: TransportSet = kinds.iter().copied().collect();
        p.supported = set;
        p.track(set, 1_000);
        h
    }

    #[test]
    fn fitness_shapes() {
        assert_eq!(size_fitness(TransportKind::CanBus, 8), 100.0);
        assert_eq!(size_fitness(TransportKind::CanBus, 28), 78.0);
        assert_eq!(size_fitness(TransportKind::Lora, 100), 70.0);
        assert_eq!(size_fitness(TransportKind::Lora, 5_000), 0.0);
        assert_eq!(size_fitness(TransportKind::EspNow, 5_000), 100.0);
    }

    #[test]
    fn fitness_non_increasing_in_length() {
        for kind in TransportKind::ALL {
            let mut prev = f32::MAX;
            for len in (0..2_000).step_by(7) {
                let f = size_fitness(kind, len);
                assert!(f <= prev, "{kind} at {len}");
                prev = f;
            }
        }
    }

    #[test]
    fn observed_rates() {
        let mut h = TransportHealth::new(0);
        assert_eq!(observed_failure_rate(&h), 0.1);
        h.send_failures = 3;
        assert_eq!(observed_failure_rate(&h), 1.0);
        h.send_successes = 6;
        assert_eq!(observed_failure_rate(&h), 0.5);
    }

    #[test]
    fn window_averages_and_slides() {
        let mut w = [0.0, 0.0, 0.0, 0.5];
        let avg = push_failure_rate(&mut w, 1.0);
        assert!((avg - 0.3).abs() < 1e-6);
        assert_eq!(w, [0.0, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn renormalize_bounds_counters() {
        assert_eq!(renormalize(2, 3), (2, 3));
        assert_eq!(renormalize(10, 10), (0, 0));
        assert_eq!(renormalize(100, 1), (4, 0));
        assert_eq!(renormalize(1, 100), (0, 4));
        assert_eq!(renormalize(0, 9), (0, 4));
        assert_eq!(renormalize(8, 4), (4, 2));
        assert_eq!(renormalize(4, 8), (2, 4));
    }

    #[test]
    fn higher_failure_rate_scores_lower() {
        let mut h = TransportHealth::new(0);
        let mut prev = f32::MAX;
        for i in 0..=9 {
            h.failure_rate = i as f32 * 0.1;
            let s = score(&h, TransportKind::Ble, 20);
            assert!(s < prev, "rate {} score {s}", h.failure_rate);
            prev = s;
        }
    }

    #[test]
    fn refresh_raises_rate_after_failures() {
        let mut h = TransportHealth::new(0);
        refresh_failure_rate(&mut h);
        let quiet = score(&h, TransportKind::Ble, 20);
        h.send_failures = 3;
        refresh_failure_rate(&mut h);
        assert!(score(&h, TransportKind::Ble, 20) < quiet);
    }

    #[test]
    fn problem_state_penalized() {
        let mut h = TransportHealth::new(0);
        let base = score(&h, TransportKind::Ble, 20);
        h.state = HealthState::Problem;
        assert_eq!(score(&h, TransportKind::Ble, 20), base - 25.0);
    }

    #[test]
    fn select_prefers_best_and_respects_exclusion() {
        let mut t = PeerTable::new();
        let h = peer_with(&mut t, &[TransportKind::Lora, TransportKind::EspNow]);
        let all = TransportSet::all();
        let p = t.get_mut(h).unwrap();
        let k = select(p, all, 50, TransportSet::empty(), -40.0, 5).unwrap();
        assert_eq!(k, TransportKind::EspNow);
        assert_eq!(p.health(TransportKind::EspNow).unwrap().last_score_time, 5);
        let k = select(p, all, 50, TransportKind::EspNow.into(), -40.0, 5).unwrap();
        assert_eq!(k, TransportKind::Lora);
        let k = select(p, TransportKind::Lora.into(), 50, TransportSet::empty(), -40.0, 5);
        assert_eq!(k, Ok(TransportKind::Lora));
    }

    #[test]
    fn select_never_returns_recovering_or_down() {
        let mut t = PeerTable::new();
        let h = peer_with(&mut t, &[TransportKind::Lora, TransportKind::EspNow]);
        let p = t.get_mut(h).unwrap();
        p.set_health_state(TransportKind::EspNow, HealthState::Recovering, Problem::Silence, 2);
        p.set_health_state(TransportKind::Lora, HealthState::Down, Problem::Silence, 2);
        assert_eq!(
            select(p, TransportSet::all(), 10, TransportSet::empty(), -40.0, 3),
            Err(NetError::NoSuitableTransport)
        );
        p.set_health_state(TransportKind::Lora, HealthState::Problem, Problem::Silence, 4);
        assert_eq!(
            select(p, TransportSet::all(), 10, TransportSet::empty(), -40.0, 5),
            Ok(TransportKind::Lora)
        );
    }

    #[test]
    fn select_fails_below_floor() {
        let mut t = PeerTable::new();
        let h = peer_with(&mut t, &[TransportKind::Lora]);
        let p = t.get_mut(h).unwrap();
        let health = p.health_mut(TransportKind::Lora).unwrap();
        health.failure_rate = 1.0;
        health.state = HealthState::Problem;
        assert_eq!(
            select(p, TransportSet::all(), 900, TransportSet::empty(), -40.0, 1),
            Err(NetError::NoSuitableTransport)
        );
    }
}
