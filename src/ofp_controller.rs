use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent, ChannelState};
use crate::config::{ChannelConfig, ControllerConfig};
use crate::demux;
use crate::error::{ChannelError, NegotiationError, OfpError, TransportError};
use crate::negotiation::negotiate;
use crate::ofp_frame::{Frame, FrameBuffer};
use crate::ofp_message::{MessageCodec, OfpMessage};
use crate::write_queue::WriteQueue;

/// OpenFlow Controller
///
/// Version-agnostic API for implementing an OpenFlow controller.
///
/// One handler serves every connection. Callbacks for a single channel never overlap and
/// arrive in wire order; callbacks for different channels run concurrently. A callback may
/// await `Channel::send_request` without holding up the channel's reader.
#[async_trait]
pub trait OfpController: Send + Sync + 'static {
    /// OpenFlow message type supporting the same protocol version as the controller.
    type Message: OfpMessage;

    /// A switch finished negotiation. Runs before any message of that switch is delivered.
    async fn on_connected(&self, _channel: &Channel<Self::Message>) {}

    /// A message arrived that is not the answer to one of our requests.
    async fn on_message(&self, channel: &Channel<Self::Message>, message: Self::Message);

    /// A frame arrived whose type no decoder is registered for.
    async fn on_unhandled(&self, channel: &Channel<Self::Message>, frame: Frame) {
        warn!(
            channel = channel.id(),
            type_code = frame.type_code(),
            xid = frame.xid(),
            length = frame.header.length(),
            "dropping unhandled message"
        );
    }

    /// The connection failed after establishment. Not called for `Channel::close`.
    async fn on_disconnected(&self, _channel: &Channel<Self::Message>, _reason: &ChannelError) {}

    /// A connection was accepted but never got past negotiation.
    async fn on_connect_failed(&self, _peer: SocketAddr, _error: &NegotiationError) {}
}

/// Negotiate on an accepted connection and, on success, start its reader and dispatcher.
///
/// Works over any byte stream split into halves, which is how tests drive channels
/// without sockets.
pub async fn serve_connection<R, W, H>(
    mut reader: R,
    writer: W,
    peer: SocketAddr,
    handler: Arc<H>,
    codec: Arc<MessageCodec<H::Message>>,
    config: ChannelConfig,
) -> Result<Channel<H::Message>, NegotiationError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    H: OfpController,
{
    let (writes, _writer) = WriteQueue::spawn(writer);
    let (channel, events) = Channel::new(peer, writes.clone(), codec);
    channel.advance(ChannelState::Negotiating);

    let mut buffer = FrameBuffer::new();
    let xid = channel.next_xid();
    let version = match negotiate(&mut reader, &mut buffer, &writes, &config, xid).await {
        Ok(version) => version,
        Err(error) => {
            warn!(%peer, %error, "negotiation failed");
            channel.teardown(TransportError::Closed.into(), false);
            handler.on_connect_failed(peer, &error).await;
            return Err(error);
        }
    };

    channel.establish(version);
    info!(channel = channel.id(), %peer, version, "channel established");
    tokio::spawn(run_dispatcher(channel.clone(), handler, events));
    tokio::spawn(demux::run_reader(reader, buffer, channel.clone(), config));
    Ok(channel)
}

/// Deliver channel events to the handler, one at a time.
async fn run_dispatcher<H: OfpController>(
    channel: Channel<H::Message>,
    handler: Arc<H>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent<H::Message>>,
) {
    // Closed between negotiation and the first poll of this task.
    if channel.is_open() {
        handler.on_connected(&channel).await;
    }
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(message) => {
                if channel.is_open() {
                    handler.on_message(&channel, message).await;
                }
            }
            ChannelEvent::Unhandled(frame) => {
                if channel.is_open() {
                    handler.on_unhandled(&channel, frame).await;
                }
            }
            ChannelEvent::Closed { reason, notify } => {
                if notify {
                    handler.on_disconnected(&channel, &reason).await;
                }
                break;
            }
        }
    }
    debug!(channel = channel.id(), "dispatcher stopped");
}

/// TCP acceptor running one channel per switch connection.
pub struct Controller<H: OfpController> {
    config: ControllerConfig,
    codec: Arc<MessageCodec<H::Message>>,
    handler: Arc<H>,
}

impl<H: OfpController> Controller<H> {
    pub fn new(config: ControllerConfig, codec: MessageCodec<H::Message>, handler: H) -> Self {
        Controller {
            config,
            codec: Arc::new(codec),
            handler: Arc::new(handler),
        }
    }

    /// Bind the listening socket without accepting yet.
    pub async fn bind(self) -> io::Result<BoundController<H>> {
        let listener = TcpListener::bind(self.config.listen).await?;
        info!(addr = %listener.local_addr()?, versions = ?self.config.versions, "listening");
        Ok(BoundController {
            listener,
            channel_config: self.config.channel_config(),
            codec: self.codec,
            handler: self.handler,
        })
    }

    /// Bind and accept connections forever.
    pub async fn run(self) -> Result<(), OfpError> {
        self.bind().await?.run().await
    }
}

/// A controller whose listener is bound.
pub struct BoundController<H: OfpController> {
    listener: TcpListener,
    channel_config: ChannelConfig,
    codec: Arc<MessageCodec<H::Message>>,
    handler: Arc<H>,
}

impl<H: OfpController> BoundController<H> {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), OfpError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Accept connections until `shutdown` completes. Channels already running are left
    /// to finish on their own.
    pub async fn run_until<F: Future>(self, shutdown: F) -> Result<(), OfpError> {
        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => {
                    info!("controller stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "accept failed");
                        continue;
                    }
                },
            };

            debug!(%peer, "accepted connection");
            if let Err(error) = stream.set_nodelay(true) {
                debug!(%peer, %error, "could not disable Nagle's algorithm");
            }
            let (reader, writer) = stream.into_split();
            let handler = self.handler.clone();
            let codec = self.codec.clone();
            let config = self.channel_config.clone();
            tokio::spawn(async move {
                // Failures were already reported to the handler.
                let _ = serve_connection(reader, writer, peer, handler, codec, config).await;
            });
        }
    }
}
