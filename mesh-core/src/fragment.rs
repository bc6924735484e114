//! Fragmentation: moving a message body larger than a transport frame as an
//! init frame plus indexed data frames, reassembled and hash-checked by the receiver.
//!
//! All frames follow the transport prefix:
//! ```text
//! init   | crc32(rest) u32 | ctx | 0 | total_len u32 | count u32 | fragment_size u32 | hash u32 |
//! data   | hash u32 | ctx | 1 | index u32 | chunk |
//! check  | hash u32 | ctx | 2 |
//! resend | hash u32 | ctx | 5 | index u32 * n |
//! result | hash u32 | ctx | 6 | code i16 |
//! ```
//! `hash` is the CRC32 of the whole body being transferred.

use std::collections::HashMap;

use crate::checksum;
use crate::peer::PeerHandle;
use crate::protocol::{Context, MessageKind};
use crate::send::ResultSlot;
use crate::transport::{PeerAddress, TransportKind};

pub const INIT_LEN: usize = 22;
pub const DATA_HEADER_LEN: usize = 10;
const CONTROL_HEADER_LEN: usize = 6;
const INDEX_LEN: usize = 4;

/// Context byte of every fragment frame.
pub fn context_byte() -> u8 {
    Context {
        kind: MessageKind::Fragmented,
        ..Context::default()
    }
    .to_byte()
}

/// True if `body` (prefix stripped) is a fragment frame rather than a message.
pub fn is_fragment_frame(body: &[u8]) -> bool {
    body.len() >= CONTROL_HEADER_LEN && body[checksum::CHECKSUM_LEN] == context_byte()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("malformed fragment frame: {0}")]
    Malformed(&'static str),
    #[error("init frame checksum mismatch")]
    InitChecksum,
    #[error("transfer of {0} bytes exceeds the reassembly limit")]
    TooLarge(usize),
    #[error("no transfer in progress for hash {0:#010x}")]
    UnknownTransfer(u32),
    #[error("fragment {index} has length {len}, expected {expected}")]
    BadLength { index: u32, len: usize, expected: usize },
    #[error("fragment index {0} out of range")]
    IndexOutOfRange(u32),
    #[error("reassembled data does not match its hash")]
    HashMismatch,
    #[error("receiver reported failure")]
    Failed,
    #[error("frame too small to carry fragments")]
    FrameTooSmall,
    #[error("timed out waiting for the receiver")]
    Timeout,
}

/// Outcome code carried by a result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Failed,
    WrongHash,
}

impl ResultCode {
    fn to_i16(self) -> i16 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Failed => -1,
            ResultCode::WrongHash => -2,
        }
    }

    fn from_i16(v: i16) -> Self {
        match v {
            0 => ResultCode::Ok,
            -2 => ResultCode::WrongHash,
            _ => ResultCode::Failed,
        }
    }

    pub fn into_result(self) -> Result<(), FragmentError> {
        match self {
            ResultCode::Ok => Ok(()),
            ResultCode::Failed => Err(FragmentError::Failed),
            ResultCode::WrongHash => Err(FragmentError::HashMismatch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub hash: u32,
    pub total_len: u32,
    pub count: u32,
    pub fragment_size: u32,
}

impl TransferHeader {
    /// Header for sending `body` in fragments of `fragment_size`.
    pub fn for_body(body: &[u8], fragment_size: usize) -> Self {
        Self {
            hash: checksum::crc32(body),
            total_len: body.len() as u32,
            count: body.len().div_ceil(fragment_size) as u32,
            fragment_size: fragment_size as u32,
        }
    }

    /// Expected length of fragment `index`.
    pub fn fragment_len(&self, index: u32) -> usize {
        let size = self.fragment_size as usize;
        if index + 1 == self.count {
            self.total_len as usize - size * (self.count as usize - 1)
        } else {
            size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentFrame<'a> {
    Init(TransferHeader),
    Data { hash: u32, index: u32, chunk: &'a [u8] },
    Check { hash: u32 },
    Resend { hash: u32, missing: Vec<u32> },
    Result { hash: u32, code: ResultCode },
}

const CODE_INIT: u8 = 0;
const CODE_DATA: u8 = 1;
const CODE_CHECK: u8 = 2;
const CODE_RESEND: u8 = 5;
const CODE_RESULT: u8 = 6;

impl<'a> FragmentFrame<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let ctx = context_byte();
        match self {
            FragmentFrame::Init(h) => {
                let mut out = vec![0u8; 4];
                out.push(ctx);
                out.push(CODE_INIT);
                out.extend_from_slice(&h.total_len.to_le_bytes());
                out.extend_from_slice(&h.count.to_le_bytes());
                out.extend_from_slice(&h.fragment_size.to_le_bytes());
                out.extend_from_slice(&h.hash.to_le_bytes());
                let crc = checksum::crc32(&out[4..]);
                out[..4].copy_from_slice(&crc.to_le_bytes());
                out
            }
            FragmentFrame::Data { hash, index, chunk } => {
                let mut out = control(*hash, CODE_DATA);
                out.extend_from_slice(&index.to_le_bytes());
                out.extend_from_slice(chunk);
                out
            }
            FragmentFrame::Check { hash } => control(*hash, CODE_CHECK),
            FragmentFrame::Resend { hash, missing } => {
                let mut out = control(*hash, CODE_RESEND);
                for i in missing {
                    out.extend_from_slice(&i.to_le_bytes());
                }
                out
            }
            FragmentFrame::Result { hash, code } => {
                let mut out = control(*hash, CODE_RESULT);
                out.extend_from_slice(&code.to_i16().to_le_bytes());
                out
            }
        }
    }

    /// Parse a fragment frame with the prefix already stripped.
    pub fn parse(body: &'a [u8]) -> Result<Self, FragmentError> {
        if !is_fragment_frame(body) {
            return Err(FragmentError::Malformed("not a fragment frame"));
        }
        let hash = read_u32(body, 0);
        let rest = &body[CONTROL_HEADER_LEN..];
        match body[5] {
            CODE_INIT => {
                if body.len() != INIT_LEN {
                    return Err(FragmentError::Malformed("init frame length"));
                }
                if checksum::crc32(&body[4..]) != hash {
                    return Err(FragmentError::InitChecksum);
                }
                Ok(FragmentFrame::Init(TransferHeader {
                    total_len: read_u32(rest, 0),
                    count: read_u32(rest, 4),
                    fragment_size: read_u32(rest, 8),
                    hash: read_u32(rest, 12),
                }))
            }
            CODE_DATA => {
                if rest.len() < INDEX_LEN {
                    return Err(FragmentError::Malformed("data frame without index"));
                }
                Ok(FragmentFrame::Data {
                    hash,
                    index: read_u32(rest, 0),
                    chunk: &rest[INDEX_LEN..],
                })
            }
            CODE_CHECK => Ok(FragmentFrame::Check { hash }),
            CODE_RESEND => {
                if rest.is_empty() || rest.len() % INDEX_LEN != 0 {
                    return Err(FragmentError::Malformed("resend index list"));
                }
                let missing = rest
                    .chunks_exact(INDEX_LEN)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Ok(FragmentFrame::Resend { hash, missing })
            }
            CODE_RESULT => {
                if rest.len() != 2 {
                    return Err(FragmentError::Malformed("result frame length"));
                }
                Ok(FragmentFrame::Result {
                    hash,
                    code: ResultCode::from_i16(i16::from_le_bytes([rest[0], rest[1]])),
                })
            }
            _ => Err(FragmentError::Malformed("unknown fragment code")),
        }
    }
}

fn control(hash: u32, code: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONTROL_HEADER_LEN);
    out.extend_from_slice(&hash.to_le_bytes());
    out.push(context_byte());
    out.push(code);
    out
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Chunk size for a transport: frame minus prefix minus data header.
pub fn fragment_size(max_frame: usize, prefix_len: usize) -> Result<usize, FragmentError> {
    match max_frame.checked_sub(prefix_len + DATA_HEADER_LEN) {
        Some(size) if size > 0 => Ok(size),
        _ => Err(FragmentError::FrameTooSmall),
    }
}

/// How many missing indices one resend frame can carry.
pub fn max_resend_indices(max_frame: usize, prefix_len: usize) -> usize {
    max_frame.saturating_sub(prefix_len + CONTROL_HEADER_LEN) / INDEX_LEN
}

/// Slice of `body` carried by fragment `index`.
pub fn chunk(body: &[u8], fragment_size: usize, index: u32) -> &[u8] {
    let start = (index as usize * fragment_size).min(body.len());
    let end = (start + fragment_size).min(body.len());
    &body[start..end]
}

/// Where a reassembly stands after a fragment or check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Every fragment arrived and the hash matches. The transfer is removed.
    Done(Vec<u8>),
    /// Ask the sender for these indices.
    Missing(Vec<u32>),
    /// Transfer removed; tell the sender.
    Rejected(ResultCode),
}

struct Reassembly {
    peer: PeerHandle,
    transport: TransportKind,
    header: TransferHeader,
    received: Vec<bool>,
    buf: Vec<u8>,
    started: u64,
    /// Highest index of the last resend request; its arrival triggers a check.
    awaited: Option<u32>,
}

/// Receiver side: in-flight transfers keyed by hash.
pub struct Reassembler {
    transfers: HashMap<u32, Reassembly>,
    max_len: usize,
}

impl Reassembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            transfers: HashMap::new(),
            max_len,
        }
    }

    /// Begin a transfer. A repeated init for the same hash restarts it.
    pub fn start(
        &mut self,
        peer: PeerHandle,
        transport: TransportKind,
        header: TransferHeader,
        now: u64,
    ) -> Result<(), FragmentError> {
        let total = header.total_len as usize;
        if total > self.max_len {
            return Err(FragmentError::TooLarge(total));
        }
        let size = header.fragment_size as usize;
        if size == 0 || total == 0 || header.count as usize != total.div_ceil(size) {
            return Err(FragmentError::Malformed("inconsistent init header"));
        }
        self.transfers.insert(
            header.hash,
            Reassembly {
                peer,
                transport,
                header,
                received: vec![false; header.count as usize],
                buf: vec![0; total],
                started: now,
                awaited: None,
            },
        );
        Ok(())
    }

    /// Store one fragment. Returns a completion when this fragment is the last
    /// one or the highest one asked for in a resend.
    pub fn accept(
        &mut self,
        hash: u32,
        index: u32,
        data: &[u8],
        max_resend: usize,
    ) -> Result<Option<Completion>, FragmentError> {
        let t = self
            .transfers
            .get_mut(&hash)
            .ok_or(FragmentError::UnknownTransfer(hash))?;
        if index >= t.header.count {
            return Err(FragmentError::IndexOutOfRange(index));
        }
        let expected = t.header.fragment_len(index);
        if data.len() != expected {
            return Err(FragmentError::BadLength {
                index,
                len: data.len(),
                expected,
            });
        }
        let start = index as usize * t.header.fragment_size as usize;
        t.buf[start..start + expected].copy_from_slice(data);
        t.received[index as usize] = true;
        if index + 1 == t.header.count || t.awaited == Some(index) {
            return self.check(hash, max_resend).map(Some);
        }
        Ok(None)
    }

    /// Evaluate a transfer: done, missing fragments, or rejected.
    pub fn check(&mut self, hash: u32, max_resend: usize) -> Result<Completion, FragmentError> {
        let t = self
            .transfers
            .get_mut(&hash)
            .ok_or(FragmentError::UnknownTransfer(hash))?;
        let missing: Vec<u32> = t
            .received
            .iter()
            .enumerate()
            .filter(|(_, got)| !**got)
            .map(|(i, _)| i as u32)
            .collect();
        if missing.is_empty() {
            let Some(t) = self.transfers.remove(&hash) else {
                return Err(FragmentError::UnknownTransfer(hash));
            };
            if checksum::crc32(&t.buf) != hash {
                return Ok(Completion::Rejected(ResultCode::WrongHash));
            }
            return Ok(Completion::Done(t.buf));
        }
        if missing.len() > max_resend {
            self.transfers.remove(&hash);
            return Ok(Completion::Rejected(ResultCode::Failed));
        }
        t.awaited = missing.last().copied();
        Ok(Completion::Missing(missing))
    }

    /// Peer and transport a transfer arrives from.
    pub fn origin(&self, hash: u32) -> Option<(PeerHandle, TransportKind)> {
        self.transfers.get(&hash).map(|t| (t.peer, t.transport))
    }

    /// Drop transfers older than `timeout_ms`. Returns the dropped hashes.
    pub fn gc(&mut self, now: u64, timeout_ms: u64) -> Vec<u32> {
        let expired: Vec<u32> = self
            .transfers
            .iter()
            .filter(|(_, t)| now.saturating_sub(t.started) > timeout_ms)
            .map(|(h, _)| *h)
            .collect();
        for hash in &expired {
            self.transfers.remove(hash);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Sender side of one transfer, kept until the receiver reports a result so
/// that resend requests can be answered.
pub struct OutgoingTransfer {
    pub peer: PeerHandle,
    pub transport: TransportKind,
    pub address: PeerAddress,
    pub prefix: Vec<u8>,
    pub header: TransferHeader,
    pub body: Vec<u8>,
    pub outcome: ResultSlot<Result<(), FragmentError>>,
}

impl OutgoingTransfer {
    pub fn new(
        peer: PeerHandle,
        transport: TransportKind,
        address: PeerAddress,
        prefix: Vec<u8>,
        body: Vec<u8>,
        fragment_size: usize,
    ) -> Self {
        Self {
            peer,
            transport,
            address,
            header: TransferHeader::for_body(&body, fragment_size),
            prefix,
            body,
            outcome: ResultSlot::new(),
        }
    }

    fn framed(&self, frame: FragmentFrame<'_>) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(&frame.encode());
        out
    }

    pub fn init_frame(&self) -> Vec<u8> {
        self.framed(FragmentFrame::Init(self.header))
    }

    pub fn data_frame(&self, index: u32) -> Vec<u8> {
        let size = self.header.fragment_size as usize;
        self.framed(FragmentFrame::Data {
            hash: self.header.hash,
            index,
            chunk: chunk(&self.body, size, index),
        })
    }

    pub fn check_frame(&self) -> Vec<u8> {
        self.framed(FragmentFrame::Check {
            hash: self.header.hash,
        })
    }
}
