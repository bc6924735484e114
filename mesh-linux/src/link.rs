//! Simulated links: a UDP socket stands in for a radio or bus segment. Every
//! datagram carries a small header so receivers can filter by destination and
//! acknowledge frames that asked for a receipt.
//!
//! ```text
//! | type u8 | seq u16 | dest mac | src mac | frame |
//! ```

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mesh_core::{Frame, LinkError, LinkSource, MacAddress, PeerAddress, Transport, TransportKind};
use parking_lot::{Condvar, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const HEADER_LEN: usize = 15;
const TYPE_DATA: u8 = 0;
const TYPE_ACK: u8 = 1;
const BROADCAST: MacAddress = MacAddress([0xFF; 6]);
const ACK_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_DATAGRAM: usize = 2048;
const INBOX_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    kind: u8,
    /// Non-zero when the sender wants an acknowledgement.
    seq: u16,
    dest: MacAddress,
    src: MacAddress,
}

fn encode_datagram(h: &Header, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + frame.len());
    out.push(h.kind);
    out.extend_from_slice(&h.seq.to_le_bytes());
    out.extend_from_slice(h.dest.as_bytes());
    out.extend_from_slice(h.src.as_bytes());
    out.extend_from_slice(frame);
    out
}

fn decode_datagram(data: &[u8]) -> Option<(Header, &[u8])> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let mut dest = [0u8; 6];
    dest.copy_from_slice(&data[3..9]);
    let mut src = [0u8; 6];
    src.copy_from_slice(&data[9..15]);
    let header = Header {
        kind: data[0],
        seq: u16::from_le_bytes([data[1], data[2]]),
        dest: MacAddress(dest),
        src: MacAddress(src),
    };
    Some((header, &data[HEADER_LEN..]))
}

#[derive(Default)]
struct Acks {
    pending: HashSet<u16>,
    received: HashSet<u16>,
}

#[derive(Default)]
struct Shared {
    inbox: Mutex<VecDeque<Frame>>,
    acks: Mutex<Acks>,
    ack_ready: Condvar,
}

/// A [`Transport`] over UDP. Sends go to every remote on the simulated medium.
pub struct UdpLink {
    kind: TransportKind,
    local: MacAddress,
    max_frame: usize,
    remotes: Vec<SocketAddr>,
    outbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    next_seq: AtomicU16,
    shared: Arc<Shared>,
}

impl UdpLink {
    pub async fn bind(
        kind: TransportKind,
        local: MacAddress,
        bind: SocketAddr,
        remotes: Vec<SocketAddr>,
        max_frame: Option<usize>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("binding {kind} link on {bind}"))?;
        tracing::info!(transport = %kind, %bind, remotes = remotes.len(), "link bound");
        Ok(Self::from_socket(kind, local, socket, remotes, max_frame))
    }

    /// Wrap a bound socket. Spawns the socket tasks on the current runtime.
    pub fn from_socket(
        kind: TransportKind,
        local: MacAddress,
        socket: UdpSocket,
        remotes: Vec<SocketAddr>,
        max_frame: Option<usize>,
    ) -> Arc<Self> {
        let socket = Arc::new(socket);
        let shared = Arc::new(Shared::default());
        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(send_loop(socket.clone(), rx));
        tokio::spawn(recv_loop(socket, shared.clone(), kind, local));
        Arc::new(Self {
            kind,
            local,
            max_frame: max_frame.unwrap_or_else(|| kind.default_max_frame()),
            remotes,
            outbound,
            next_seq: AtomicU16::new(1),
            shared,
        })
    }

    fn next_seq(&self) -> u16 {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    fn wait_ack(&self, seq: u16) -> Result<(), LinkError> {
        let deadline = Instant::now() + ACK_TIMEOUT;
        let mut acks = self.shared.acks.lock();
        loop {
            if acks.received.remove(&seq) {
                acks.pending.remove(&seq);
                return Ok(());
            }
            if self
                .shared
                .ack_ready
                .wait_until(&mut acks, deadline)
                .timed_out()
            {
                acks.pending.remove(&seq);
                return if acks.received.remove(&seq) {
                    Ok(())
                } else {
                    Err(LinkError::NoReceipt)
                };
            }
        }
    }
}

impl Transport for UdpLink {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame
    }

    fn send(&self, to: &PeerAddress, frame: &[u8], receipt: bool) -> Result<(), LinkError> {
        if frame.len() > self.max_frame {
            return Err(LinkError::TooLong);
        }
        let seq = if receipt { self.next_seq() } else { 0 };
        if receipt {
            self.shared.acks.lock().pending.insert(seq);
        }
        let datagram = encode_datagram(
            &Header {
                kind: TYPE_DATA,
                seq,
                dest: to.mac,
                src: self.local,
            },
            frame,
        );
        for remote in &self.remotes {
            if self.outbound.send((datagram.clone(), *remote)).is_err() {
                self.shared.acks.lock().pending.remove(&seq);
                return Err(LinkError::Unavailable);
            }
        }
        if receipt {
            self.wait_ack(seq)
        } else {
            Ok(())
        }
    }

    fn poll(&self) -> Option<Frame> {
        self.shared.inbox.lock().pop_front()
    }
}

async fn send_loop(socket: Arc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) {
    while let Some((datagram, to)) = rx.recv().await {
        if let Err(err) = socket.send_to(&datagram, to).await {
            tracing::debug!(%to, %err, "datagram not sent");
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>, kind: TransportKind, local: MacAddress) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(err) => {
                tracing::debug!(transport = %kind, %err, "receive failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let Some((h, frame)) = decode_datagram(&buf[..n]) else {
            tracing::debug!(transport = %kind, %from, "runt datagram");
            continue;
        };
        if h.src == local {
            continue;
        }
        let for_us = h.dest == local || h.dest == BROADCAST;
        match h.kind {
            TYPE_ACK if for_us => {
                let mut acks = shared.acks.lock();
                if acks.pending.contains(&h.seq) {
                    acks.received.insert(h.seq);
                    shared.ack_ready.notify_all();
                }
            }
            TYPE_DATA if for_us || kind.in_band_addressing() => {
                if h.seq != 0 && h.dest == local {
                    let ack = Header {
                        kind: TYPE_ACK,
                        seq: h.seq,
                        dest: h.src,
                        src: local,
                    };
                    if let Err(err) = socket.send_to(&encode_datagram(&ack, &[]), from).await {
                        tracing::debug!(%from, %err, "ack not sent");
                    }
                }
                let source = if kind.in_band_addressing() {
                    None
                } else {
                    Some(LinkSource::Mac(h.src))
                };
                let mut inbox = shared.inbox.lock();
                if inbox.len() >= INBOX_LIMIT {
                    tracing::warn!(transport = %kind, "link inbox full, frame dropped");
                    continue;
                }
                inbox.push_back(Frame {
                    data: frame.to_vec(),
                    source,
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x0A]);
    const B: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x0B]);
    const C: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x0C]);

    fn addr(mac: MacAddress) -> PeerAddress {
        PeerAddress {
            mac,
            i2c_address: 0,
            can_address: 0,
        }
    }

    async fn pair(kind: TransportKind) -> (Arc<UdpLink>, Arc<UdpLink>) {
        let sa = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sb = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (aa, ab) = (sa.local_addr().unwrap(), sb.local_addr().unwrap());
        (
            UdpLink::from_socket(kind, A, sa, vec![ab], None),
            UdpLink::from_socket(kind, B, sb, vec![aa], None),
        )
    }

    async fn next_frame(link: &UdpLink) -> Option<Frame> {
        for _ in 0..400 {
            if let Some(f) = link.poll() {
                return Some(f);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[test]
    fn header_layout() {
        let h = Header {
            kind: TYPE_DATA,
            seq: 0x0102,
            dest: B,
            src: A,
        };
        let bytes = encode_datagram(&h, b"xyz");
        assert_eq!(&bytes[..3], &[0, 0x02, 0x01]);
        assert_eq!(decode_datagram(&bytes), Some((h, &b"xyz"[..])));
        assert_eq!(decode_datagram(&bytes[..HEADER_LEN - 1]), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receipted_frame_is_delivered_and_acknowledged() {
        let (a, b) = pair(TransportKind::EspNow).await;
        let sender = a.clone();
        let sent = tokio::task::spawn_blocking(move || sender.send(&addr(B), b"hello", true))
            .await
            .unwrap();
        assert_eq!(sent, Ok(()));
        let frame = next_frame(&b).await.unwrap();
        assert_eq!(frame.data, b"hello");
        assert_eq!(frame.source, Some(LinkSource::Mac(A)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frame_for_someone_else_gets_no_receipt() {
        let (a, b) = pair(TransportKind::EspNow).await;
        let sender = a.clone();
        let sent = tokio::task::spawn_blocking(move || sender.send(&addr(C), b"hello", true))
            .await
            .unwrap();
        assert_eq!(sent, Err(LinkError::NoReceipt));
        assert!(b.poll().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn in_band_links_hear_everything() {
        let (a, b) = pair(TransportKind::Lora).await;
        assert_eq!(a.send(&addr(C), b"broadcast", false), Ok(()));
        let frame = next_frame(&b).await.unwrap();
        assert_eq!(frame.data, b"broadcast");
        assert_eq!(frame.source, None);
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (a, _b) = pair(TransportKind::EspNow).await;
        let big = vec![0u8; a.max_frame_len() + 1];
        assert_eq!(a.send(&addr(B), &big, false), Err(LinkError::TooLong));
    }
}
