//! Transport boundary: kinds, sets of kinds, the driver trait and in-band addressing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer::MacAddress;

/// A communication technology a node may use to reach a peer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ble,
    EspNow,
    Lora,
    I2c,
    CanBus,
    Mock,
}

impl TransportKind {
    pub const ALL: [TransportKind; 6] = [
        TransportKind::Ble,
        TransportKind::EspNow,
        TransportKind::Lora,
        TransportKind::I2c,
        TransportKind::CanBus,
        TransportKind::Mock,
    ];

    /// Bit used in the on-wire transport bitmask.
    pub fn bit(self) -> u8 {
        match self {
            TransportKind::Ble => 1,
            TransportKind::EspNow => 2,
            TransportKind::Lora => 4,
            TransportKind::I2c => 8,
            TransportKind::CanBus => 16,
            TransportKind::Mock => 128,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Ble => "ble",
            TransportKind::EspNow => "espnow",
            TransportKind::Lora => "lora",
            TransportKind::I2c => "i2c",
            TransportKind::CanBus => "canbus",
            TransportKind::Mock => "mock",
        }
    }

    /// Whether frames carry the addressing prefix themselves (broadcast media).
    /// Other transports get sender/receiver addresses from the link layer.
    pub fn in_band_addressing(self) -> bool {
        matches!(self, TransportKind::Lora | TransportKind::Mock)
    }

    /// Largest frame a driver of this kind accepts in one send, prefix included.
    pub fn default_max_frame(self) -> usize {
        match self {
            TransportKind::Ble => 512,
            TransportKind::EspNow => 250,
            TransportKind::Lora => 255,
            TransportKind::I2c => 128,
            TransportKind::CanBus => 1024,
            TransportKind::Mock => 250,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        TransportKind::ALL
            .into_iter()
            .find(|k| k.name() == lower)
            .ok_or_else(|| format!("unknown transport: {s}"))
    }
}

/// A set of transport kinds; serialized as the on-wire bitmask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportSet(u8);

impl TransportSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        TransportKind::ALL.into_iter().collect()
    }

    /// Unknown bits are dropped.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::all().0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, kind: TransportKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: TransportKind) {
        self.0 |= kind.bit();
    }

    pub fn remove(&mut self, kind: TransportKind) {
        self.0 &= !kind.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = TransportKind> {
        TransportKind::ALL
            .into_iter()
            .filter(move |k| self.contains(*k))
    }
}

impl FromIterator<TransportKind> for TransportSet {
    fn from_iter<I: IntoIterator<Item = TransportKind>>(iter: I) -> Self {
        let mut set = TransportSet::empty();
        for k in iter {
            set.insert(k);
        }
        set
    }
}

impl From<TransportKind> for TransportSet {
    fn from(kind: TransportKind) -> Self {
        Self(kind.bit())
    }
}

impl fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Where a driver should deliver a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub mac: MacAddress,
    pub i2c_address: u8,
    pub can_address: u8,
}

/// Link-layer source of a received frame, for link-addressed transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    Mac(MacAddress),
    Bus(u8),
}

/// A received frame, prefix still attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub source: Option<LinkSource>,
}

/// Error reported by a transport driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("send failed")]
    SendFailed,
    #[error("no receipt from peer")]
    NoReceipt,
    #[error("peer does not recognize us")]
    Who,
    #[error("frame too long for transport")]
    TooLong,
    #[error("transport unavailable")]
    Unavailable,
}

/// A transport driver. Implementations guard their own hardware; calls may come
/// from the transport's worker thread and from inbound handling concurrently.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn max_frame_len(&self) -> usize {
        self.kind().default_max_frame()
    }

    /// Deliver one frame. With `receipt`, success means the peer acknowledged it.
    fn send(&self, to: &PeerAddress, frame: &[u8], receipt: bool) -> Result<(), LinkError>;

    /// Next received frame, if any. Must not block.
    fn poll(&self) -> Option<Frame>;
}

/// Prefix length of an established relation (outgoing relation id).
pub const RELATION_PREFIX_LEN: usize = 4;
/// Prefix length before a relation exists (destination and source MAC).
pub const MAC_PREFIX_LEN: usize = 12;

/// Addressing carried in front of frames on in-band transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InBandPrefix {
    Relation(u32),
    Macs { dest: MacAddress, src: MacAddress },
}

impl InBandPrefix {
    pub fn len(&self) -> usize {
        match self {
            InBandPrefix::Relation(_) => RELATION_PREFIX_LEN,
            InBandPrefix::Macs { .. } => MAC_PREFIX_LEN,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            InBandPrefix::Relation(id) => id.to_le_bytes().to_vec(),
            InBandPrefix::Macs { dest, src } => {
                let mut out = Vec::with_capacity(MAC_PREFIX_LEN);
                out.extend_from_slice(dest.as_bytes());
                out.extend_from_slice(src.as_bytes());
                out
            }
        }
    }

    /// Read the prefix of a frame addressed to `host`. A frame starting with the
    /// host MAC uses the MAC form; anything else is read as a relation id.
    pub fn parse(data: &[u8], host: &MacAddress) -> Option<Self> {
        if data.len() >= MAC_PREFIX_LEN && &data[..6] == host.as_bytes() {
            let mut src = [0u8; 6];
            src.copy_from_slice(&data[6..MAC_PREFIX_LEN]);
            return Some(InBandPrefix::Macs {
                dest: *host,
                src: MacAddress(src),
            });
        }
        if data.len() >= RELATION_PREFIX_LEN {
            return Some(InBandPrefix::Relation(u32::from_le_bytes([
                data[0], data[1], data[2], data[3],
            ])));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_iterates_in_kind_order() {
        let set: TransportSet = [TransportKind::Mock, TransportKind::Ble, TransportKind::Lora]
            .into_iter()
            .collect();
        assert_eq!(set.bits(), 1 | 4 | 128);
        let kinds: Vec<_> = set.iter().collect();
        assert_eq!(
            kinds,
            vec![TransportKind::Ble, TransportKind::Lora, TransportKind::Mock]
        );
    }

    #[test]
    fn set_operations() {
        let a = TransportSet::from_bits(0b0000_0111);
        let b: TransportSet = TransportKind::EspNow.into();
        assert!(a.contains(TransportKind::EspNow));
        assert_eq!(a.difference(b).len(), 2);
        assert_eq!(a.intersection(b), b);
        assert!(b.is_subset(a));
        assert!(!a.is_subset(b));
    }

    #[test]
    fn unknown_bits_dropped() {
        assert_eq!(TransportSet::from_bits(0b0110_0000).bits(), 0);
    }

    #[test]
    fn parse_kind() {
        assert_eq!("ESPNOW".parse::<TransportKind>().unwrap(), TransportKind::EspNow);
        assert!("wifi".parse::<TransportKind>().is_err());
    }

    #[test]
    fn mac_prefix_recognized_for_host() {
        let host = MacAddress([1, 2, 3, 4, 5, 6]);
        let src = MacAddress([9, 9, 9, 9, 9, 9]);
        let prefix = InBandPrefix::Macs { dest: host, src };
        let bytes = prefix.to_bytes();
        assert_eq!(InBandPrefix::parse(&bytes, &host), Some(prefix));
    }

    #[test]
    fn other_frames_read_as_relation() {
        let host = MacAddress([1, 2, 3, 4, 5, 6]);
        let bytes = InBandPrefix::Relation(0xDEAD_BEEF).to_bytes();
        assert_eq!(
            InBandPrefix::parse(&bytes, &host),
            Some(InBandPrefix::Relation(0xDEAD_BEEF))
        );
        assert_eq!(InBandPrefix::parse(&[1, 2], &host), None);
    }
}
