//! End-to-end channel behavior over an in-memory stream, with the test playing the switch.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

use rust_ofp_channel::config::ChannelConfig;
use rust_ofp_channel::error::{
    ChannelError, DecodeError, ErrorReport, NegotiationError, OfpError, ProtocolError,
    TransactionError, TransportError,
};
use rust_ofp_channel::logging;
use rust_ofp_channel::ofp_controller::{serve_connection, OfpController};
use rust_ofp_channel::ofp_frame::{read_frame, Frame, FrameBuffer};
use rust_ofp_channel::ofp_header::{type_code, OfpHeader, OFP_HEADER_SIZE};
use rust_ofp_channel::ofp_message::{MessageCodec, OfpMessage, RawMessage};
use rust_ofp_channel::Channel;

const FEATURES_REQUEST: u8 = 5;
const FEATURES_REPLY: u8 = 6;
const CONFIG_REQUEST: u8 = 7;
const CONFIG_REPLY: u8 = 8;
const PACKET_IN: u8 = 10;
const PACKET_OUT: u8 = 13;

#[derive(Debug)]
enum Event {
    Connected(u8),
    Message(RawMessage),
    Unhandled(u8),
    Disconnected(ChannelError),
    ConnectFailed(NegotiationError),
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl OfpController for Recorder {
    type Message = RawMessage;

    async fn on_connected(&self, channel: &Channel<RawMessage>) {
        let _ = self.events.send(Event::Connected(channel.version()));
    }

    async fn on_message(&self, _channel: &Channel<RawMessage>, message: RawMessage) {
        let _ = self.events.send(Event::Message(message));
    }

    async fn on_unhandled(&self, _channel: &Channel<RawMessage>, frame: Frame) {
        let _ = self.events.send(Event::Unhandled(frame.type_code()));
    }

    async fn on_disconnected(&self, _channel: &Channel<RawMessage>, reason: &ChannelError) {
        let _ = self.events.send(Event::Disconnected(reason.clone()));
    }

    async fn on_connect_failed(&self, _peer: SocketAddr, error: &NegotiationError) {
        let _ = self.events.send(Event::ConnectFailed(error.clone()));
    }
}

struct Switch {
    stream: DuplexStream,
    buffer: FrameBuffer,
}

impl Switch {
    async fn send(&mut self, type_code: u8, xid: u32, body: &[u8]) {
        let bytes = RawMessage::new(type_code, body.to_vec())
            .marshal(1, xid)
            .unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        read_frame(&mut self.stream, &mut self.buffer).await.unwrap()
    }
}

/// Write half that starts failing with `BrokenPipe` once `broken` is set.
struct BreakableWriter {
    inner: WriteHalf<DuplexStream>,
    broken: Arc<AtomicBool>,
}

impl AsyncWrite for BreakableWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "link cut")));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn codec() -> MessageCodec<RawMessage> {
    let mut codec = MessageCodec::new();
    codec
        .register(PACKET_IN, RawMessage::parse)
        .register(FEATURES_REPLY, RawMessage::parse)
        .register(CONFIG_REPLY, |_: &OfpHeader, _: &[u8]| {
            Err(DecodeError::invalid("config reply", "flags out of range"))
        })
        .register_reply(FEATURES_REQUEST, FEATURES_REPLY)
        .register_reply(CONFIG_REQUEST, CONFIG_REPLY);
    codec
}

fn config() -> ChannelConfig {
    ChannelConfig {
        versions: vec![1],
        keepalive_interval: None,
        ..ChannelConfig::default()
    }
}

struct Started {
    result: Result<Channel<RawMessage>, NegotiationError>,
    switch: Switch,
    events: mpsc::UnboundedReceiver<Event>,
    broken: Arc<AtomicBool>,
}

async fn start(config: ChannelConfig, switch_hello: &[u8]) -> Started {
    start_with_capacity(config, switch_hello, 64 * 1024).await
}

async fn start_with_capacity(
    config: ChannelConfig,
    switch_hello: &[u8],
    capacity: usize,
) -> Started {
    logging::init_for_tests();
    let (local, remote) = tokio::io::duplex(capacity);
    let mut switch = Switch {
        stream: remote,
        buffer: FrameBuffer::new(),
    };
    switch.stream.write_all(switch_hello).await.unwrap();

    let (tx, events) = mpsc::unbounded_channel();
    let (reader, inner) = tokio::io::split(local);
    let broken = Arc::new(AtomicBool::new(false));
    let writer = BreakableWriter {
        inner,
        broken: broken.clone(),
    };
    let result = serve_connection(
        reader,
        writer,
        "10.0.0.1:40000".parse().unwrap(),
        Arc::new(Recorder { events: tx }),
        Arc::new(codec()),
        config,
    )
    .await;
    Started {
        result,
        switch,
        events,
        broken,
    }
}

fn plain_hello() -> Vec<u8> {
    RawMessage::new(type_code::HELLO, vec![]).marshal(1, 1).unwrap()
}

/// Establish a channel with a plain version-1 hello and consume the controller's hello.
async fn connect(
    config: ChannelConfig,
) -> (Channel<RawMessage>, Switch, mpsc::UnboundedReceiver<Event>) {
    let (channel, switch, events, _broken) = connect_with_capacity(config, 64 * 1024).await;
    (channel, switch, events)
}

async fn connect_with_capacity(
    config: ChannelConfig,
    capacity: usize,
) -> (
    Channel<RawMessage>,
    Switch,
    mpsc::UnboundedReceiver<Event>,
    Arc<AtomicBool>,
) {
    let Started {
        result,
        mut switch,
        mut events,
        broken,
    } = start_with_capacity(config, &plain_hello(), capacity).await;
    let channel = result.unwrap();
    assert_eq!(switch.recv().await.type_code(), type_code::HELLO);
    assert!(matches!(events.recv().await, Some(Event::Connected(1))));
    (channel, switch, events, broken)
}

async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(event) = tokio::time::timeout(Duration::from_millis(50), events.recv()).await {
        panic!("unexpected event {:?}", event);
    }
}

#[tokio::test]
async fn negotiated_channel_reports_connected_first() {
    let (channel, _switch, _events) = connect(config()).await;
    assert!(channel.is_open());
    assert_eq!(channel.version(), 1);
}

#[tokio::test]
async fn channel_closed_before_dispatch_starts_reports_nothing() {
    let Started {
        result, mut events, ..
    } = start(config(), &plain_hello()).await;
    let channel = result.unwrap();
    channel.close();

    assert!(!channel.is_open());
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn incompatible_switch_is_refused() {
    // Bitmap element offering version 4 only.
    let hello = RawMessage::new(type_code::HELLO, vec![0, 1, 0, 8, 0, 0, 0, 0x10])
        .marshal(4, 3)
        .unwrap();
    let Started {
        result,
        mut switch,
        mut events,
        ..
    } = start(config(), &hello).await;
    assert!(matches!(
        result,
        Err(NegotiationError::Protocol(ProtocolError::Incompatible { .. }))
    ));
    assert!(matches!(events.recv().await, Some(Event::ConnectFailed(_))));

    assert_eq!(switch.recv().await.type_code(), type_code::HELLO);
    let error = switch.recv().await;
    assert_eq!(error.type_code(), type_code::ERROR);
    assert_eq!(error.xid(), 3);
    assert_eq!(&error.body[..4], &[0, 0, 0, 0]);
}

#[tokio::test]
async fn messages_reach_the_handler_in_wire_order() {
    let (_channel, mut switch, mut events) = connect(config()).await;
    switch.send(PACKET_IN, 10, &[1, 2, 3]).await;
    switch.send(99, 11, &[]).await;
    switch.send(PACKET_IN, 12, &[4]).await;

    match events.recv().await {
        Some(Event::Message(message)) => assert_eq!(message.body, vec![1, 2, 3]),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(events.recv().await, Some(Event::Unhandled(99))));
    match events.recv().await {
        Some(Event::Message(message)) => assert_eq!(message.body, vec![4]),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn echo_request_is_answered_by_the_engine() {
    let (_channel, mut switch, mut events) = connect(config()).await;
    switch.send(type_code::ECHO_REQUEST, 77, b"abc").await;

    let reply = switch.recv().await;
    assert_eq!(reply.type_code(), type_code::ECHO_REPLY);
    assert_eq!(reply.xid(), 77);
    assert_eq!(&reply.body[..], b"abc");
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn reply_resolves_request_and_skips_the_handler() {
    let (channel, mut switch, mut events) = connect(config()).await;
    let requester = channel.clone();
    let request = tokio::spawn(async move {
        requester
            .send_request(
                RawMessage::new(FEATURES_REQUEST, vec![]),
                Some(Duration::from_secs(5)),
            )
            .await
    });

    let sent = switch.recv().await;
    assert_eq!(sent.type_code(), FEATURES_REQUEST);
    switch.send(FEATURES_REPLY, sent.xid(), &[0xaa]).await;

    let reply = request.await.unwrap().unwrap();
    assert_eq!(reply, RawMessage::new(FEATURES_REPLY, vec![0xaa]));
    assert_eq!(channel.pending_transactions(), 0);
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn error_frame_fails_the_matching_request() {
    let (channel, mut switch, _events) = connect(config()).await;
    let requester = channel.clone();
    let request = tokio::spawn(async move {
        requester
            .send_request(RawMessage::new(FEATURES_REQUEST, vec![]), None)
            .await
    });

    let sent = switch.recv().await;
    let mut body = vec![0, 1, 0, 2];
    body.extend_from_slice(&sent.to_bytes()[..OFP_HEADER_SIZE]);
    switch.send(type_code::ERROR, sent.xid(), &body).await;

    match request.await.unwrap() {
        Err(TransactionError::Application(ErrorReport { err_type, code, data })) => {
            assert_eq!((err_type, code), (1, 2));
            assert_eq!(data[1], FEATURES_REQUEST);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn close_fails_pending_work_and_silences_the_handler() {
    let (channel, mut switch, mut events) = connect(config()).await;
    let requester = channel.clone();
    let request = tokio::spawn(async move {
        requester
            .send_request(RawMessage::new(FEATURES_REQUEST, vec![]), None)
            .await
    });
    let sent = switch.recv().await;

    channel.close();
    assert_eq!(
        request.await.unwrap(),
        Err(TransactionError::Transport(TransportError::Closed))
    );
    assert!(!channel.is_open());
    assert_eq!(channel.pending_transactions(), 0);

    // Late traffic from the switch goes nowhere.
    let reply = RawMessage::new(FEATURES_REPLY, vec![]).marshal(1, sent.xid()).unwrap();
    let _ = switch.stream.write_all(&reply).await;
    assert_quiet(&mut events).await;

    let err = channel
        .send(RawMessage::new(PACKET_IN, vec![]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("closed"));
}

#[tokio::test]
async fn close_fails_the_pending_request_and_queued_writes_alike() {
    // A 64-byte pipe nobody drains stalls the writer on the first large message.
    let (channel, _switch, mut events, _broken) = connect_with_capacity(config(), 64).await;

    let mut sends = Vec::new();
    for len in [200, 10, 20] {
        let sender = channel.clone();
        sends.push(tokio::spawn(async move {
            sender.send(RawMessage::new(PACKET_OUT, vec![0; len])).await
        }));
        tokio::task::yield_now().await;
    }
    let requester = channel.clone();
    let request = tokio::spawn(async move {
        requester
            .send_request(RawMessage::new(FEATURES_REQUEST, vec![]), None)
            .await
    });
    while channel.pending_writes() < 4 || channel.pending_transactions() < 1 {
        tokio::task::yield_now().await;
    }

    channel.close();
    for send in sends {
        assert!(matches!(
            send.await.unwrap(),
            Err(OfpError::Transport(TransportError::Closed))
        ));
    }
    assert_eq!(
        request.await.unwrap(),
        Err(TransactionError::Transport(TransportError::Closed))
    );
    assert_eq!(channel.pending_writes(), 0);
    assert_eq!(channel.pending_transactions(), 0);
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn undecodable_reply_closes_the_channel() {
    let (channel, mut switch, mut events) = connect(config()).await;
    let requester = channel.clone();
    let request = tokio::spawn(async move {
        requester
            .send_request(RawMessage::new(CONFIG_REQUEST, vec![]), None)
            .await
    });
    let sent = switch.recv().await;
    switch.send(CONFIG_REPLY, sent.xid(), &[0xff, 0xff, 0, 0]).await;

    assert!(matches!(
        events.recv().await,
        Some(Event::Disconnected(ChannelError::Protocol(ProtocolError::Decode(_))))
    ));
    assert!(matches!(
        request.await.unwrap(),
        Err(TransactionError::Transport(TransportError::Aborted(_)))
    ));
    assert!(!channel.is_open());
}

#[tokio::test]
async fn write_failure_disconnects_the_channel() {
    let (channel, _switch, mut events, broken) = connect_with_capacity(config(), 64 * 1024).await;
    broken.store(true, Ordering::SeqCst);

    let result = channel
        .send_request(RawMessage::new(FEATURES_REQUEST, vec![]), None)
        .await;
    assert!(matches!(
        result,
        Err(TransactionError::Transport(TransportError::Io {
            kind: io::ErrorKind::BrokenPipe,
            ..
        }))
    ));

    match events.recv().await {
        Some(Event::Disconnected(ChannelError::Transport(TransportError::Io { kind, .. }))) => {
            assert_eq!(kind, io::ErrorKind::BrokenPipe)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!channel.is_open());
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn peer_hangup_is_reported_once() {
    let (channel, switch, mut events) = connect(config()).await;
    drop(switch);

    match events.recv().await {
        Some(Event::Disconnected(reason)) => {
            assert_eq!(reason, ChannelError::Transport(TransportError::Eof))
        }
        other => panic!("unexpected {:?}", other),
    }
    channel.closed().await;
    assert!(!channel.is_open());
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn undecodable_length_aborts_pending_requests() {
    let (channel, mut switch, mut events) = connect(config()).await;
    let requester = channel.clone();
    let request = tokio::spawn(async move {
        requester
            .send_request(RawMessage::new(FEATURES_REQUEST, vec![]), None)
            .await
    });
    switch.recv().await;

    // Header length below the header size.
    switch.stream.write_all(&[1, 10, 0, 4, 0, 0, 0, 9]).await.unwrap();

    assert!(matches!(
        events.recv().await,
        Some(Event::Disconnected(ChannelError::Protocol(ProtocolError::BadLength { length: 4 })))
    ));
    assert!(matches!(
        request.await.unwrap(),
        Err(TransactionError::Transport(TransportError::Aborted(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn silent_switch_fails_keepalive() {
    let config = ChannelConfig {
        versions: vec![1],
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_grace: Duration::from_secs(10),
        ..ChannelConfig::default()
    };
    let (channel, mut switch, mut events) = connect(config).await;

    let echo = switch.recv().await;
    assert_eq!(echo.type_code(), type_code::ECHO_REQUEST);

    match events.recv().await {
        Some(Event::Disconnected(reason)) => {
            assert_eq!(reason, ChannelError::Transport(TransportError::KeepaliveTimeout))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!channel.is_open());
}

#[tokio::test(start_paused = true)]
async fn answered_keepalive_keeps_the_channel_up() {
    let config = ChannelConfig {
        versions: vec![1],
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_grace: Duration::from_secs(10),
        ..ChannelConfig::default()
    };
    let (channel, mut switch, mut events) = connect(config).await;

    let echo = switch.recv().await;
    switch.send(type_code::ECHO_REPLY, echo.xid(), &[]).await;
    let second = switch.recv().await;
    assert_eq!(second.type_code(), type_code::ECHO_REQUEST);
    assert_ne!(second.xid(), echo.xid());
    assert!(channel.is_open());
    assert!(events.try_recv().is_err());
}
