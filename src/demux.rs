//! Steady-state read loop of an established channel.
//!
//! Frames are dispatched in wire order:
//!
//! 1. ECHO_REQUEST is answered here, with the same xid and body.
//! 2. ECHO_REPLY to our own keepalive echo is consumed.
//! 3. A late HELLO is ignored.
//! 4. The transaction registry gets the first look at everything else. An expected reply
//!    must decode before it resolves its request.
//! 5. What the registry declines is decoded and queued for the handler, or queued raw when
//!    no decoder is registered for its type.
//!
//! A transport error on either half, EOF or undecodable frame ends the loop and tears the
//! channel down.

use tokio::io::AsyncRead;
use tokio::time::timeout;

use crate::channel::{Channel, ChannelEvent};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ProtocolError, TransportError};
use crate::ofp_frame::{read_frame, Frame, FrameBuffer};
use crate::ofp_header::type_code;
use crate::ofp_message::{OfpMessage, RawMessage};

/// Read and dispatch frames until the connection fails or the channel is closed.
///
/// `buffer` may already hold bytes that arrived right behind the peer's hello.
pub(crate) async fn run_reader<R, M>(
    mut reader: R,
    mut buffer: FrameBuffer,
    channel: Channel<M>,
    config: ChannelConfig,
) where
    R: AsyncRead + Unpin,
    M: OfpMessage,
{
    let mut shutdown = channel.subscribe_shutdown();
    let faulted = channel.writes().faulted();
    tokio::pin!(faulted);
    let mut awaiting_echo = None;
    let error = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => {
                tracing::debug!(channel = channel.id(), "reader stopping");
                return;
            }
            fault = &mut faulted => {
                tracing::warn!(channel = channel.id(), error = %fault, "write failed");
                break ChannelError::Transport(fault);
            }
            next = next_frame(&mut reader, &mut buffer, &channel, &config, &mut awaiting_echo) => next,
        };
        if let Err(error) = next.and_then(|frame| dispatch(&channel, frame, &mut awaiting_echo)) {
            break error;
        }
    };
    channel.teardown(error, true);
}

/// Read the next frame, probing the peer with an ECHO_REQUEST when it has been idle for
/// the keepalive interval.
async fn next_frame<R, M>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
    channel: &Channel<M>,
    config: &ChannelConfig,
    awaiting_echo: &mut Option<u32>,
) -> Result<Frame, ChannelError>
where
    R: AsyncRead + Unpin,
    M: OfpMessage,
{
    let Some(interval) = config.keepalive_interval else {
        return read_frame(reader, buffer).await;
    };
    if let Ok(result) = timeout(interval, read_frame(reader, buffer)).await {
        return result;
    }

    let xid = channel.next_xid();
    tracing::debug!(channel = channel.id(), xid, "peer idle, sending keepalive echo");
    let echo = RawMessage::new(type_code::ECHO_REQUEST, vec![]);
    drop(channel.writes().submit(echo.marshal(channel.version(), xid)?));
    *awaiting_echo = Some(xid);

    match timeout(config.keepalive_grace, read_frame(reader, buffer)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(channel = channel.id(), peer = %channel.peer_addr(), "keepalive echo unanswered");
            Err(TransportError::KeepaliveTimeout.into())
        }
    }
}

/// Route one frame.
pub(crate) fn dispatch<M: OfpMessage>(
    channel: &Channel<M>,
    frame: Frame,
    awaiting_echo: &mut Option<u32>,
) -> Result<(), ChannelError> {
    let xid = frame.xid();
    match frame.type_code() {
        type_code::ECHO_REQUEST => {
            let reply = RawMessage::new(type_code::ECHO_REPLY, frame.body.to_vec());
            drop(channel.writes().submit(reply.marshal(channel.version(), xid)?));
            tracing::trace!(channel = channel.id(), xid, "answered echo request");
            return Ok(());
        }
        type_code::ECHO_REPLY if *awaiting_echo == Some(xid) => {
            *awaiting_echo = None;
            tracing::trace!(channel = channel.id(), xid, "keepalive answered");
            return Ok(());
        }
        type_code::HELLO => {
            tracing::warn!(channel = channel.id(), xid, "ignoring hello on established channel");
            return Ok(());
        }
        _ => {}
    }

    if channel.transactions().expects(xid, frame.type_code()) {
        // The requester decodes it again; a reply that cannot decode is a peer fault.
        if let Err(error) = channel.codec().decode(&frame.header, &frame.body) {
            tracing::error!(channel = channel.id(), xid, type_code = frame.type_code(), %error, "undecodable reply");
            return Err(ProtocolError::Decode(error).into());
        }
    }

    let Some(frame) = channel.transactions().dispatch(frame) else {
        return Ok(());
    };

    match channel.codec().decode(&frame.header, &frame.body) {
        Ok(Some(message)) => {
            tracing::debug!(channel = channel.id(), xid, type_code = frame.type_code(), "message received");
            channel.emit(ChannelEvent::Message(message));
            Ok(())
        }
        Ok(None) => {
            tracing::debug!(channel = channel.id(), xid, type_code = frame.type_code(), "no decoder for message");
            channel.emit(ChannelEvent::Unhandled(frame));
            Ok(())
        }
        Err(error) => {
            tracing::error!(channel = channel.id(), xid, type_code = frame.type_code(), %error, "undecodable message");
            Err(ProtocolError::Decode(error).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::ofp_header::{OfpHeader, OFP_HEADER_SIZE};
    use crate::ofp_message::MessageCodec;
    use crate::write_queue::WriteQueue;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    const PACKET_IN: u8 = 10;
    const BROKEN: u8 = 11;

    fn frame(typ: u8, xid: u32, body: &[u8]) -> Frame {
        Frame::new(
            OfpHeader::new(1, typ, (OFP_HEADER_SIZE + body.len()) as u16, xid),
            Bytes::copy_from_slice(body),
        )
    }

    fn established() -> (
        Channel<RawMessage>,
        mpsc::UnboundedReceiver<ChannelEvent<RawMessage>>,
        DuplexStream,
    ) {
        let mut codec = MessageCodec::new();
        codec
            .register(PACKET_IN, RawMessage::parse)
            .register(BROKEN, |_: &OfpHeader, _: &[u8]| {
                Err(DecodeError::invalid("message", "always broken"))
            });
        let (local, remote) = tokio::io::duplex(1024);
        let (writes, _task) = WriteQueue::spawn(local);
        let (channel, events) =
            Channel::new("127.0.0.1:6653".parse().unwrap(), writes, Arc::new(codec));
        channel.establish(1);
        (channel, events, remote)
    }

    #[tokio::test]
    async fn echo_request_is_answered_without_the_handler() {
        let (channel, mut events, mut remote) = established();
        let mut awaiting_echo = None;
        dispatch(&channel, frame(type_code::ECHO_REQUEST, 42, b"ping"), &mut awaiting_echo).unwrap();

        let mut buffer = FrameBuffer::new();
        let reply = read_frame(&mut remote, &mut buffer).await.unwrap();
        assert_eq!(reply.type_code(), type_code::ECHO_REPLY);
        assert_eq!(reply.xid(), 42);
        assert_eq!(&reply.body[..], b"ping");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn keepalive_reply_is_consumed_once() {
        let (channel, mut events, _remote) = established();
        let mut awaiting_echo = Some(5);
        dispatch(&channel, frame(type_code::ECHO_REPLY, 5, &[]), &mut awaiting_echo).unwrap();
        assert_eq!(awaiting_echo, None);
        assert!(events.try_recv().is_err());

        dispatch(&channel, frame(type_code::ECHO_REPLY, 5, &[]), &mut awaiting_echo).unwrap();
        assert!(matches!(events.try_recv(), Ok(ChannelEvent::Unhandled(_))));
    }

    #[tokio::test]
    async fn known_and_unknown_types_reach_the_dispatcher() {
        let (channel, mut events, _remote) = established();
        let mut awaiting_echo = None;
        dispatch(&channel, frame(PACKET_IN, 1, &[9]), &mut awaiting_echo).unwrap();
        dispatch(&channel, frame(99, 2, &[]), &mut awaiting_echo).unwrap();
        dispatch(&channel, frame(type_code::HELLO, 3, &[]), &mut awaiting_echo).unwrap();

        match events.try_recv() {
            Ok(ChannelEvent::Message(message)) => assert_eq!(message, RawMessage::new(PACKET_IN, vec![9])),
            _ => panic!("expected decoded message"),
        }
        match events.try_recv() {
            Ok(ChannelEvent::Unhandled(frame)) => assert_eq!(frame.type_code(), 99),
            _ => panic!("expected unhandled frame"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn decode_failure_is_a_protocol_error() {
        let (channel, _events, _remote) = established();
        let mut awaiting_echo = None;
        let err = dispatch(&channel, frame(BROKEN, 1, &[]), &mut awaiting_echo).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(ProtocolError::Decode(_))));
    }

    #[tokio::test]
    async fn undecodable_expected_reply_is_a_protocol_error() {
        let (channel, mut events, _remote) = established();
        let _pending = channel.transactions().register(4, 5, BROKEN, None).unwrap();
        let mut awaiting_echo = None;

        let err = dispatch(&channel, frame(BROKEN, 4, &[]), &mut awaiting_echo).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(ProtocolError::Decode(_))));
        assert_eq!(channel.pending_transactions(), 1);
        assert!(events.try_recv().is_err());
    }
}
