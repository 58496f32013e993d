//! Ordered write queue.
//!
//! Any number of tasks submit byte buffers; one writer task owns the write half of the
//! transport and drains them in submission order.
//!
//! ```text
//! Channel::send ──┐
//! echo replies  ──┼─► mpsc::UnboundedSender<WriteRequest> ─► writer task ─► transport
//! negotiation   ──┘
//! ```
//!
//! A request's bytes are written completely (short writes are continued, never
//! interleaved with the next request) and flushed before its completion fires. A transport
//! failure fails the request being written and every request still queued with the same
//! error, and is published to `WriteQueue::faulted` so the owner can tear the connection
//! down.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::TransportError;

/// Observable state of the writer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteQueueState {
    /// Nothing is being written.
    Idle,
    /// The writer is draining submitted requests.
    Draining,
    /// A transport failure is being fanned out to the queued requests.
    Faulted,
}

impl WriteQueueState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WriteQueueState::Draining,
            2 => WriteQueueState::Faulted,
            _ => WriteQueueState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WriteQueueState::Idle => 0,
            WriteQueueState::Draining => 1,
            WriteQueueState::Faulted => 2,
        }
    }
}

/// One submitted buffer, owned by the queue until it completes.
#[derive(Debug)]
pub struct WriteRequest {
    pub payload: Bytes,
    pub submission_order: u64,
    completion: oneshot::Sender<Result<usize, TransportError>>,
}

impl WriteRequest {
    fn complete(self, result: Result<usize, TransportError>) {
        // The submitter may have stopped waiting.
        let _ = self.completion.send(result);
    }
}

/// Completion of one submitted write: the number of bytes written, or why they were not.
#[derive(Debug)]
#[must_use = "a write completion does nothing unless awaited"]
pub struct WriteCompletion {
    rx: oneshot::Receiver<Result<usize, TransportError>>,
}

impl Future for WriteCompletion {
    type Output = Result<usize, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Writer task went away without answering.
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Submitter {
    tx: mpsc::UnboundedSender<WriteRequest>,
    next_order: u64,
    closed: bool,
}

/// State shared with the writer task. The sender lives outside it, so the writer task
/// ends once every `WriteQueue` handle is gone.
struct Shared {
    state: AtomicU8,
    pending: AtomicUsize,
    close_tx: watch::Sender<Option<TransportError>>,
    fault_tx: watch::Sender<Option<TransportError>>,
}

impl Shared {
    fn set_state(&self, state: WriteQueueState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn finish(&self, request: WriteRequest, result: Result<usize, TransportError>) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        request.complete(result);
    }
}

/// Handle for submitting writes to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub struct WriteQueue {
    submitter: Arc<Mutex<Submitter>>,
    shared: Arc<Shared>,
}

impl WriteQueue {
    /// Spawn the writer task over `writer` and return the submission handle.
    pub fn spawn<W>(writer: W) -> (WriteQueue, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(None);
        let (fault_tx, _) = watch::channel(None);
        let submitter = Arc::new(Mutex::new(Submitter {
            tx,
            next_order: 0,
            closed: false,
        }));
        let shared = Arc::new(Shared {
            state: AtomicU8::new(WriteQueueState::Idle.as_u8()),
            pending: AtomicUsize::new(0),
            close_tx,
            fault_tx,
        });

        let task = tokio::spawn(writer_loop(rx, writer, shared.clone(), close_rx));
        (WriteQueue { submitter, shared }, task)
    }

    /// Queue `payload` behind everything submitted before it.
    ///
    /// The request is enqueued when this is called; awaiting the returned completion only
    /// observes the outcome. After `close`, the completion fails with
    /// `TransportError::Closed` without touching the transport.
    pub fn submit(&self, payload: impl Into<Bytes>) -> WriteCompletion {
        let (completion, rx) = oneshot::channel();
        let mut submitter = self.submitter.lock();
        let request = WriteRequest {
            payload: payload.into(),
            submission_order: submitter.next_order,
            completion,
        };
        if submitter.closed {
            request.complete(Err(TransportError::Closed));
            return WriteCompletion { rx };
        }
        submitter.next_order += 1;
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(request)) = submitter.tx.send(request) {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            request.complete(Err(TransportError::Closed));
        }
        WriteCompletion { rx }
    }

    /// Fail everything queued with `reason`, shut the transport's write side down and
    /// refuse later submissions. Only the first call has any effect.
    pub fn close(&self, reason: TransportError) {
        {
            let mut submitter = self.submitter.lock();
            if submitter.closed {
                return;
            }
            submitter.closed = true;
        }
        tracing::debug!(%reason, "closing write queue");
        self.shared.close_tx.send_replace(Some(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.submitter.lock().closed
    }

    pub fn state(&self) -> WriteQueueState {
        WriteQueueState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Resolve with the first transport failure the writer hits. Never resolves for a queue
    /// that is closed without one.
    pub async fn faulted(&self) -> TransportError {
        let mut faults = self.shared.fault_tx.subscribe();
        let fault = match faults.wait_for(Option::is_some).await {
            Ok(fault) => fault.clone().unwrap_or(TransportError::Closed),
            // `shared` owns the sender and outlives this borrow.
            Err(_) => TransportError::Closed,
        };
        fault
    }

    /// Number of submitted requests that have not completed yet.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    mut writer: W,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<Option<TransportError>>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        shared.set_state(WriteQueueState::Draining);
        let result = tokio::select! {
            biased;
            _ = close_rx.changed() => {
                shared.finish(request, Err(close_reason(&close_rx)));
                break;
            }
            result = write_payload(&mut writer, &request.payload) => result,
        };

        match result {
            Ok(written) => {
                tracing::trace!(order = request.submission_order, written, "write completed");
                shared.finish(request, Ok(written));
                if shared.pending.load(Ordering::Acquire) == 0 {
                    shared.set_state(WriteQueueState::Idle);
                }
            }
            Err(error) => {
                shared.set_state(WriteQueueState::Faulted);
                tracing::debug!(order = request.submission_order, %error, "write failed");
                shared.finish(request, Err(error.clone()));
                fail_queued(&mut rx, &shared, &error);
                shared.fault_tx.send_if_modified(|fault| {
                    if fault.is_some() {
                        return false;
                    }
                    *fault = Some(error.clone());
                    true
                });
                shared.set_state(WriteQueueState::Idle);
            }
        }
        if close_rx.borrow().is_some() {
            break;
        }
    }

    let reason = close_reason(&close_rx);
    rx.close();
    fail_queued(&mut rx, &shared, &reason);
    shared.set_state(WriteQueueState::Idle);
    if let Err(error) = writer.shutdown().await {
        tracing::trace!(%error, "transport shutdown failed");
    }
}

fn close_reason(close_rx: &watch::Receiver<Option<TransportError>>) -> TransportError {
    close_rx.borrow().clone().unwrap_or(TransportError::Closed)
}

/// Complete every request still in the channel with `error`.
fn fail_queued(
    rx: &mut mpsc::UnboundedReceiver<WriteRequest>,
    shared: &Shared,
    error: &TransportError,
) {
    let mut failed = 0;
    while let Ok(request) = rx.try_recv() {
        shared.finish(request, Err(error.clone()));
        failed += 1;
    }
    if failed > 0 {
        tracing::debug!(failed, %error, "failed queued writes");
    }
}

/// Write all of `payload`, continuing after short writes, then flush.
async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<usize, TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < payload.len() {
        let n = writer.write(&payload[written..]).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "transport accepted zero bytes").into());
        }
        written += n;
    }
    writer.flush().await?;
    Ok(written)
}
