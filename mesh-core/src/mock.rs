//! In-memory links for tests: pairs of endpoints that hand frames to each other,
//! with failure injection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::peer::MacAddress;
use crate::transport::{Frame, LinkError, LinkSource, PeerAddress, Transport, TransportKind};

pub struct MockLink {
    kind: TransportKind,
    local: MacAddress,
    max_frame: usize,
    inbox: Mutex<VecDeque<Frame>>,
    remote: Mutex<Weak<MockLink>>,
    fail_next: AtomicU32,
    who_next: AtomicU32,
    down: AtomicBool,
    sent: AtomicU32,
}

impl MockLink {
    pub fn new(kind: TransportKind, local: MacAddress) -> Arc<Self> {
        Self::with_max_frame(kind, local, kind.default_max_frame())
    }

    pub fn with_max_frame(kind: TransportKind, local: MacAddress, max_frame: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            local,
            max_frame,
            inbox: Mutex::new(VecDeque::new()),
            remote: Mutex::new(Weak::new()),
            fail_next: AtomicU32::new(0),
            who_next: AtomicU32::new(0),
            down: AtomicBool::new(false),
            sent: AtomicU32::new(0),
        })
    }

    /// Two connected endpoints.
    pub fn pair(kind: TransportKind, a: MacAddress, b: MacAddress) -> (Arc<Self>, Arc<Self>) {
        let x = Self::new(kind, a);
        let y = Self::new(kind, b);
        *x.remote.lock() = Arc::downgrade(&y);
        *y.remote.lock() = Arc::downgrade(&x);
        (x, y)
    }

    /// The next `n` sends fail with `SendFailed`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// The next `n` sends fail with `Who`.
    pub fn who_next(&self, n: u32) {
        self.who_next.store(n, Ordering::SeqCst);
    }

    /// While down, frames vanish and receipts are never given.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Take the oldest frame waiting in this endpoint's inbox.
    pub fn take(&self) -> Option<Frame> {
        self.inbox.lock().pop_front()
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Transport for MockLink {
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
        self.sent.fetch_add(1, Ordering::SeqCst);
        if Self::consume(&self.who_next) {
            return Err(LinkError::Who);
        }
        if Self::consume(&self.fail_next) {
            return Err(LinkError::SendFailed);
        }
        let lost = || if receipt { Err(LinkError::NoReceipt) } else { Ok(()) };
        if self.down.load(Ordering::SeqCst) {
            return lost();
        }
        let Some(remote) = self.remote.lock().upgrade() else {
            return lost();
        };
        let source = if self.kind.in_band_addressing() {
            None
        } else {
            if remote.local != to.mac {
                return lost();
            }
            Some(LinkSource::Mac(self.local))
        };
        remote.inbox.lock().push_back(Frame {
            data: frame.to_vec(),
            source,
        });
        Ok(())
    }

    fn poll(&self) -> Option<Frame> {
        self.take()
    }
}
