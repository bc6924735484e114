//! Relations: the small persisted record of each confirmed peer, used to rebuild
//! peers after a reset. Records are framed as 4-byte LE length + bincode.

use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::peer::MacAddress;
use crate::transport::TransportSet;

const LEN_SIZE: usize = 4;
const MAX_RECORD_LEN: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub mac: MacAddress,
    pub relation_id_incoming: u32,
    pub relation_id_outgoing: u32,
    pub supported: TransportSet,
    pub i2c_address: u8,
    pub can_address: u8,
}

/// Fixed-capacity relation table. Entries are only appended.
pub struct RelationTable {
    entries: Vec<Relation>,
    capacity: usize,
}

impl RelationTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Append a relation. `Ok(false)` if one for this MAC already exists.
    /// A full table is reported loudly: it is a possible attack signal.
    pub fn add(&mut self, relation: Relation) -> Result<bool, NetError> {
        if self.find_by_mac(&relation.mac).is_some() {
            return Ok(false);
        }
        if self.entries.len() >= self.capacity {
            tracing::error!(
                mac = %relation.mac,
                capacity = self.capacity,
                "relation table full, refusing new relation (possible attack)"
            );
            return Err(NetError::TooManyRelations);
        }
        self.entries.push(relation);
        Ok(true)
    }

    pub fn find_by_mac(&self, mac: &MacAddress) -> Option<&Relation> {
        self.entries.iter().find(|r| r.mac == *mac)
    }

    /// MAC of the peer that addresses us with `relation_id_incoming`.
    pub fn mac_for_incoming(&self, relation_id_incoming: u32) -> Option<MacAddress> {
        self.entries
            .iter()
            .find(|r| r.relation_id_incoming == relation_id_incoming)
            .map(|r| r.mac)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persistence boundary. Implementations append; they never rewrite in place.
pub trait RelationStore: Send + Sync {
    fn load(&self) -> Result<Vec<Relation>, StoreError>;
    fn append(&self, relation: &Relation) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record error: {0}")]
    Record(#[from] RecordDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Encode one relation as a length-prefixed record.
pub fn encode_record(relation: &Relation) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(relation)?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error decoding a record (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum RecordDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("record too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Decode one record from the front of `bytes`. Returns it and the bytes consumed.
pub fn decode_record(bytes: &[u8]) -> Result<(Relation, usize), RecordDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(RecordDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_RECORD_LEN {
        return Err(RecordDecodeError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(RecordDecodeError::NeedMore);
    }
    let relation = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((relation, LEN_SIZE + len))
}

/// Decode every complete record. A torn trailing record (interrupted append) is ignored.
pub fn decode_records(mut bytes: &[u8]) -> Result<Vec<Relation>, RecordDecodeError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        match decode_record(bytes) {
            Ok((r, n)) => {
                out.push(r);
                bytes = &bytes[n..];
            }
            Err(RecordDecodeError::NeedMore) => {
                tracing::warn!(trailing = bytes.len(), "ignoring incomplete relation record");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    fn relation(last: u8) -> Relation {
        Relation {
            mac: MacAddress([1, 2, 3, 4, 5, last]),
            relation_id_incoming: 100 + last as u32,
            relation_id_outgoing: 200 + last as u32,
            supported: TransportKind::Lora.into(),
            i2c_address: 0,
            can_address: 0,
        }
    }

    #[test]
    fn duplicate_mac_not_added() {
        let mut t = RelationTable::new(4);
        assert_eq!(t.add(relation(1)).unwrap(), true);
        assert_eq!(t.add(relation(1)).unwrap(), false);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn full_table_is_an_error() {
        let mut t = RelationTable::new(2);
        t.add(relation(1)).unwrap();
        t.add(relation(2)).unwrap();
        assert_eq!(t.add(relation(3)), Err(NetError::TooManyRelations));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn incoming_id_lookup() {
        let mut t = RelationTable::new(4);
        t.add(relation(7)).unwrap();
        assert_eq!(t.mac_for_incoming(107), Some(MacAddress([1, 2, 3, 4, 5, 7])));
        assert_eq!(t.mac_for_incoming(207), None);
    }

    #[test]
    fn records_concatenate() {
        let mut buf = Vec::new();
        buf.extend(encode_record(&relation(1)).unwrap());
        buf.extend(encode_record(&relation(2)).unwrap());
        let all = decode_records(&buf).unwrap();
        assert_eq!(all, vec![relation(1), relation(2)]);
    }

    #[test]
    fn partial_record_need_more() {
        let rec = encode_record(&relation(1)).unwrap();
        assert!(matches!(
            decode_record(&rec[..2]),
            Err(RecordDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_record(&rec[..rec.len() - 1]),
            Err(RecordDecodeError::NeedMore)
        ));
        let mut torn = rec.clone();
        torn.extend_from_slice(&rec[..3]);
        assert_eq!(decode_records(&torn).unwrap().len(), 1);
    }

    #[test]
    fn oversized_length_rejected() {
        let bytes = (MAX_RECORD_LEN + 1).to_le_bytes();
        assert!(matches!(
            decode_record(&bytes),
            Err(RecordDecodeError::TooLarge)
        ));
    }
}
