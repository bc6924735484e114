//! Network tunables. Deserializable so hosts can embed it in their own config file.

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumKind;
use crate::scoring::DEFAULT_ACCEPTABLE_SCORE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Checksum written into outgoing messages (default crc32).
    #[serde(default)]
    pub checksum: ChecksumKind,
    /// Expected interval between heartbeats on an idle transport.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat interval while a transport has a problem.
    #[serde(default = "default_problem_heartbeat_ms")]
    pub problem_heartbeat_ms: u64,
    /// heard_from_limit = heartbeat_interval_ms * this.
    #[serde(default = "default_heard_from_multiplier")]
    pub heard_from_multiplier: u64,
    /// Failed recoveries before a transport is considered down.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Capacity of the persisted relation table.
    #[serde(default = "default_max_relations")]
    pub max_relations: usize,
    /// Per-transport send queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long a caller of `send` waits for the final outcome, failovers included.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How long to wait for one queued item to be attempted.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// How long a presentation waits for the peer to answer.
    #[serde(default = "default_presentation_timeout_ms")]
    pub presentation_timeout_ms: u64,
    /// Fragmented transfers: sender result wait and receiver reassembly lifetime.
    #[serde(default = "default_fragment_timeout_ms")]
    pub fragment_timeout_ms: u64,
    /// Largest payload accepted for fragmented transfer.
    #[serde(default = "default_max_fragmented_len")]
    pub max_fragmented_len: usize,
    /// Selection fails if the best transport scores below this.
    #[serde(default = "default_acceptable_score")]
    pub acceptable_score: f32,
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}
fn default_problem_heartbeat_ms() -> u64 {
    500
}
fn default_heard_from_multiplier() -> u64 {
    6
}
fn default_max_recovery_attempts() -> u32 {
    3
}
fn default_max_relations() -> usize {
    32
}
fn default_queue_capacity() -> usize {
    64
}
fn default_send_timeout_ms() -> u64 {
    15_000
}
fn default_queue_timeout_ms() -> u64 {
    6_000
}
fn default_presentation_timeout_ms() -> u64 {
    10_000
}
fn default_fragment_timeout_ms() -> u64 {
    5_000
}
fn default_max_fragmented_len() -> usize {
    1024 * 1024
}
fn default_acceptable_score() -> f32 {
    DEFAULT_ACCEPTABLE_SCORE
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            checksum: ChecksumKind::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            problem_heartbeat_ms: default_problem_heartbeat_ms(),
            heard_from_multiplier: default_heard_from_multiplier(),
            max_recovery_attempts: default_max_recovery_attempts(),
            max_relations: default_max_relations(),
            queue_capacity: default_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            queue_timeout_ms: default_queue_timeout_ms(),
            presentation_timeout_ms: default_presentation_timeout_ms(),
            fragment_timeout_ms: default_fragment_timeout_ms(),
            max_fragmented_len: default_max_fragmented_len(),
            acceptable_score: default_acceptable_score(),
        }
    }
}
