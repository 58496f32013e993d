//! Request/reply correlation.
//!
//! Every request that expects an answer is registered under its xid. The entry leaves the
//! table exactly once: on the matching reply, on an error frame naming the request, on its
//! deadline, or when the channel closes. Whoever removes the entry delivers the outcome;
//! everyone else finds nothing and does nothing.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{DecodeError, ErrorReport, ProtocolError, TransactionError, TransportError};
use crate::ofp_frame::Frame;
use crate::ofp_header::{type_code, OFP_HEADER_SIZE};

/// Outcome delivered to the caller of a request.
pub type TransactionResult = Result<Frame, TransactionError>;

/// Per-channel source of transaction ids.
#[derive(Debug)]
pub struct XidAllocator {
    next: AtomicU32,
}

impl XidAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        XidAllocator {
            next: AtomicU32::new(first),
        }
    }

    /// Return a fresh xid. Wraps around, skipping zero.
    pub fn next(&self) -> u32 {
        loop {
            let xid = self.next.fetch_add(1, Ordering::Relaxed);
            if xid != 0 {
                return xid;
            }
        }
    }
}

impl Default for XidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReport {
    /// Parse the body of an ERROR frame: type, code, then the data of the failed request.
    pub fn from_body(body: &[u8]) -> Result<ErrorReport, DecodeError> {
        if body.len() < 4 {
            return Err(DecodeError::Truncated {
                what: "error message",
                needed: 4,
                available: body.len(),
            });
        }
        Ok(ErrorReport {
            err_type: BigEndian::read_u16(&body[0..2]),
            code: BigEndian::read_u16(&body[2..4]),
            data: body[4..].to_vec(),
        })
    }

    /// Type code of the request this error refers to, read from the header echoed at the
    /// start of the data.
    pub fn failed_request_type(&self) -> Option<u8> {
        if self.data.len() < OFP_HEADER_SIZE {
            return None;
        }
        Some(self.data[1])
    }
}

struct Pending {
    generation: u64,
    request_kind: u8,
    expected_kind: u8,
    slot: oneshot::Sender<TransactionResult>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn resolve(self, outcome: TransactionResult) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting.
        let _ = self.slot.send(outcome);
    }
}

struct Table {
    pending: HashMap<u32, Pending>,
    next_generation: u64,
    closed: Option<TransportError>,
}

impl Table {
    /// Remove the entry for `xid` if it is still the registration `generation` refers to.
    fn take(&mut self, xid: u32, generation: u64) -> Option<Pending> {
        match self.pending.get(&xid) {
            Some(pending) if pending.generation == generation => self.pending.remove(&xid),
            _ => None,
        }
    }
}

/// Table of outstanding requests for one channel.
#[derive(Clone)]
pub struct TransactionRegistry {
    table: Arc<Mutex<Table>>,
    reply_kinds: Arc<HashSet<u8>>,
}

impl TransactionRegistry {
    /// Create an empty registry. `reply_kinds` lists every type code that answers some
    /// request; such a frame arriving for a pending xid that expected something else is a
    /// protocol violation rather than an unsolicited message.
    pub fn new(reply_kinds: impl IntoIterator<Item = u8>) -> Self {
        TransactionRegistry {
            table: Arc::new(Mutex::new(Table {
                pending: HashMap::new(),
                next_generation: 0,
                closed: None,
            })),
            reply_kinds: Arc::new(reply_kinds.into_iter().collect()),
        }
    }

    /// Start waiting for the answer to request `xid`.
    ///
    /// With a `deadline`, the transaction resolves with `TransactionError::Timeout` once it
    /// elapses unless something else resolved it first.
    pub fn register(
        &self,
        xid: u32,
        request_kind: u8,
        expected_kind: u8,
        deadline: Option<Duration>,
    ) -> Result<TransactionHandle, TransactionError> {
        let mut table = self.table.lock();
        if let Some(reason) = &table.closed {
            return Err(TransactionError::Transport(reason.clone()));
        }
        if table.pending.contains_key(&xid) {
            return Err(ProtocolError::DuplicateXid(xid).into());
        }

        let generation = table.next_generation;
        table.next_generation += 1;

        let timer = deadline.map(|deadline| {
            let table = Arc::downgrade(&self.table);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                expire(&table, xid, generation);
            })
        });

        let (slot, rx) = oneshot::channel();
        table.pending.insert(
            xid,
            Pending {
                generation,
                request_kind,
                expected_kind,
                slot,
                timer,
            },
        );
        tracing::debug!(xid, request_kind, expected_kind, ?deadline, "transaction registered");

        Ok(TransactionHandle {
            xid,
            generation,
            rx,
            table: Arc::downgrade(&self.table),
            done: false,
        })
    }

    /// Resolve the pending transaction `xid` with `outcome`.
    ///
    /// Returns false if nothing was pending under that xid.
    pub fn resolve(&self, xid: u32, outcome: TransactionResult) -> bool {
        let pending = self.table.lock().pending.remove(&xid);
        match pending {
            Some(pending) => {
                pending.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Offer an incoming frame to the registry.
    ///
    /// Returns the frame back when it does not answer any pending request.
    pub fn dispatch(&self, frame: Frame) -> Option<Frame> {
        let xid = frame.xid();
        let actual = frame.type_code();
        let mut table = self.table.lock();
        let (request_kind, expected_kind) = match table.pending.get(&xid) {
            Some(pending) => (pending.request_kind, pending.expected_kind),
            None => return Some(frame),
        };

        let outcome = if actual == expected_kind {
            Ok(frame)
        } else if actual == type_code::ERROR {
            match ErrorReport::from_body(&frame.body) {
                Ok(report) if report.failed_request_type() == Some(request_kind) => {
                    Err(TransactionError::Application(report))
                }
                _ => return Some(frame),
            }
        } else if self.reply_kinds.contains(&actual) {
            tracing::warn!(xid, expected = expected_kind, actual, "reply of the wrong kind");
            Err(ProtocolError::UnexpectedReply {
                xid,
                expected: expected_kind,
                actual,
            }
            .into())
        } else {
            return Some(frame);
        };

        let pending = table.pending.remove(&xid);
        drop(table);
        if let Some(pending) = pending {
            tracing::debug!(xid, ok = outcome.is_ok(), "transaction resolved");
            pending.resolve(outcome);
        }
        None
    }

    /// Resolve every pending transaction with `reason` and refuse new registrations.
    pub fn cancel_all(&self, reason: TransportError) {
        let drained: Vec<Pending> = {
            let mut table = self.table.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.clone());
            }
            table.pending.drain().map(|(_, pending)| pending).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), %reason, "cancelling pending transactions");
        }
        for pending in drained {
            pending.resolve(Err(TransactionError::Transport(reason.clone())));
        }
    }

    /// Number of transactions still waiting.
    pub fn len(&self) -> usize {
        self.table.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a frame of type `type_code` under `xid` is the reply a pending request waits
    /// for.
    pub fn expects(&self, xid: u32, type_code: u8) -> bool {
        matches!(
            self.table.lock().pending.get(&xid),
            Some(pending) if pending.expected_kind == type_code
        )
    }

    pub fn is_pending(&self, xid: u32) -> bool {
        self.table.lock().pending.contains_key(&xid)
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        let mut xids: Vec<u32> = table.pending.keys().copied().collect();
        xids.sort_unstable();
        f.debug_struct("TransactionRegistry")
            .field("pending", &xids)
            .field("closed", &table.closed)
            .finish()
    }
}

fn expire(table: &Weak<Mutex<Table>>, xid: u32, generation: u64) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let pending = table.lock().take(xid, generation);
    if let Some(pending) = pending {
        tracing::debug!(xid, "transaction timed out");
        // Resolving aborts this very task, which is already finishing.
        pending.resolve(Err(TransactionError::Timeout));
    }
}

/// The caller's end of a pending transaction.
///
/// Resolves to the reply frame or to the reason there is none. Dropping the handle before
/// it resolves withdraws the transaction.
#[derive(Debug)]
#[must_use = "a transaction is withdrawn when its handle is dropped"]
pub struct TransactionHandle {
    xid: u32,
    generation: u64,
    rx: oneshot::Receiver<TransactionResult>,
    table: Weak<Mutex<Table>>,
    done: bool,
}

impl TransactionHandle {
    pub fn xid(&self) -> u32 {
        self.xid
    }
}

impl Future for TransactionHandle {
    type Output = TransactionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(TransactionError::Transport(TransportError::Closed)),
            Poll::Pending => return Poll::Pending,
        };
        self.done = true;
        Poll::Ready(result)
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let pending = table.lock().take(self.xid, self.generation);
        if let Some(pending) = pending {
            tracing::debug!(xid = self.xid, "transaction abandoned");
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
    }
}
