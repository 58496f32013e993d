//! The application-facing handle for one switch connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::error::{ChannelError, DecodeError, OfpError, ProtocolError, TransactionError, TransportError};
use crate::ofp_frame::Frame;
use crate::ofp_message::{MessageCodec, OfpMessage};
use crate::transaction::{TransactionRegistry, XidAllocator};
use crate::write_queue::WriteQueue;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    Connecting,
    Negotiating,
    Established,
    Closing,
    Closed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Negotiating,
            2 => ChannelState::Established,
            3 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Work handed from the reader to the handler dispatcher.
pub(crate) enum ChannelEvent<M> {
    Message(M),
    Unhandled(Frame),
    Closed { reason: ChannelError, notify: bool },
}

struct ChannelInner<M> {
    id: u64,
    peer: SocketAddr,
    state: AtomicU8,
    version: AtomicU8,
    xids: XidAllocator,
    writes: WriteQueue,
    transactions: TransactionRegistry,
    codec: Arc<MessageCodec<M>>,
    events: mpsc::UnboundedSender<ChannelEvent<M>>,
    shutdown: watch::Sender<bool>,
}

/// OpenFlow Channel
///
/// A cheaply cloneable handle on one controller-to-switch session. Every clone refers to
/// the same connection; the reader, the writer, the handler dispatcher and the application
/// all hold one.
pub struct Channel<M> {
    inner: Arc<ChannelInner<M>>,
}

impl<M> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Channel {
            inner: self.inner.clone(),
        }
    }
}

impl<M: OfpMessage> Channel<M> {
    pub(crate) fn new(
        peer: SocketAddr,
        writes: WriteQueue,
        codec: Arc<MessageCodec<M>>,
    ) -> (Channel<M>, mpsc::UnboundedReceiver<ChannelEvent<M>>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let transactions = TransactionRegistry::new(codec.reply_kinds());
        let inner = ChannelInner {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            state: AtomicU8::new(ChannelState::Connecting.as_u8()),
            version: AtomicU8::new(0),
            xids: XidAllocator::new(),
            writes,
            transactions,
            codec,
            events,
            shutdown,
        };
        (
            Channel {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Negotiated protocol version; zero until negotiation succeeds.
    pub fn version(&self) -> u8 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Established
    }

    /// Allocate a transaction id unused on this channel.
    pub fn next_xid(&self) -> u32 {
        self.inner.xids.next()
    }

    /// Number of requests still waiting for their answer.
    pub fn pending_transactions(&self) -> usize {
        self.inner.transactions.len()
    }

    /// Number of writes submitted and not yet on the wire.
    pub fn pending_writes(&self) -> usize {
        self.inner.writes.pending_count()
    }

    /// Send a message that expects no answer. Returns the xid it was sent with.
    pub async fn send(&self, message: M) -> Result<u32, OfpError> {
        let xid = self.next_xid();
        self.send_with_xid(xid, &message).await?;
        Ok(xid)
    }

    /// Send a message under a caller-chosen xid, e.g. to answer a switch's request.
    pub async fn send_with_xid(&self, xid: u32, message: &M) -> Result<(), OfpError> {
        if !self.is_open() {
            return Err(TransportError::Closed.into());
        }
        let bytes = message.marshal(self.version(), xid)?;
        tracing::trace!(
            channel = self.id(),
            xid,
            type_code = message.msg_code(),
            "sending message"
        );
        self.inner.writes.submit(bytes).await?;
        Ok(())
    }

    /// Send a request and wait for its reply.
    ///
    /// Without a `deadline` the request waits until the reply, an error frame naming it,
    /// or the channel closing.
    pub async fn send_request(
        &self,
        message: M,
        deadline: Option<Duration>,
    ) -> Result<M, TransactionError> {
        if !self.is_open() {
            return Err(TransportError::Closed.into());
        }
        let request_kind = message.msg_code();
        let expected_kind = self
            .inner
            .codec
            .expected_reply(request_kind)
            .ok_or(ProtocolError::NotARequest(request_kind))?;
        let xid = self.next_xid();
        let bytes = message.marshal(self.version(), xid)?;

        let transaction =
            self.inner
                .transactions
                .register(xid, request_kind, expected_kind, deadline)?;
        tracing::debug!(channel = self.id(), xid, request_kind, "sending request");
        self.inner.writes.submit(bytes).await?;

        let frame = transaction.await?;
        match self.inner.codec.decode(&frame.header, &frame.body) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(ProtocolError::Decode(DecodeError::invalid(
                "reply",
                format!("no decoder for message type {}", frame.type_code()),
            ))
            .into()),
            Err(error) => Err(ProtocolError::Decode(error).into()),
        }
    }

    /// Close the connection from the application side.
    ///
    /// Pending requests and queued writes fail with `TransportError::Closed`, and no further
    /// handler callbacks are made for this channel, `on_disconnected` included.
    pub fn close(&self) {
        self.teardown(TransportError::Closed.into(), false);
    }

    /// Wait until the channel has shut down.
    pub async fn closed(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    pub(crate) fn writes(&self) -> &WriteQueue {
        &self.inner.writes
    }

    pub(crate) fn transactions(&self) -> &TransactionRegistry {
        &self.inner.transactions
    }

    pub(crate) fn codec(&self) -> &MessageCodec<M> {
        &self.inner.codec
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub(crate) fn emit(&self, event: ChannelEvent<M>) {
        // The dispatcher is gone once the channel closed.
        let _ = self.inner.events.send(event);
    }

    /// Move forward to `next`. Returns false if the channel is already at or past it.
    pub(crate) fn advance(&self, next: ChannelState) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if current >= next.as_u8() {
                return false;
            }
            match self.inner.state.compare_exchange(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn establish(&self, version: u8) -> bool {
        self.inner.version.store(version, Ordering::Release);
        self.advance(ChannelState::Established)
    }

    /// Shut the channel down. Only the first caller does anything.
    ///
    /// Every pending transaction and queued write fails with the transport form of
    /// `reason`. With `notify`, the dispatcher delivers `on_disconnected` before it stops.
    pub(crate) fn teardown(&self, reason: ChannelError, notify: bool) -> bool {
        if !self.advance(ChannelState::Closing) {
            return false;
        }
        if notify {
            tracing::info!(channel = self.id(), peer = %self.peer_addr(), %reason, "channel disconnected");
        } else {
            tracing::info!(channel = self.id(), peer = %self.peer_addr(), "channel closed");
        }

        let transport = reason.to_transport();
        self.inner.shutdown.send_replace(true);
        self.inner.transactions.cancel_all(transport.clone());
        self.inner.writes.close(transport);
        self.emit(ChannelEvent::Closed { reason, notify });
        self.advance(ChannelState::Closed);
        true
    }
}

impl<M> fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field(
                "state",
                &ChannelState::from_u8(self.inner.state.load(Ordering::Acquire)),
            )
            .field("version", &self.inner.version.load(Ordering::Acquire))
            .finish()
    }
}
