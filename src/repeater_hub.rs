use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::ofp_controller::OfpController;
use crate::openflow0x01::message::Message;
use crate::openflow0x01::{Action, PacketIn, PacketOut, PseudoPort};

/// How long a switch gets to answer the features request.
const FEATURES_DEADLINE: Duration = Duration::from_secs(5);

/// Controller turning every switch into a hub: each packet the switch reports is flooded
/// out of all ports but the one it came in on. No flows are installed.
#[derive(Debug, Default)]
pub struct RepeaterHub {}

impl RepeaterHub {
    pub fn new() -> RepeaterHub {
        RepeaterHub {}
    }

    fn flood(pkt: PacketIn) -> PacketOut {
        PacketOut {
            output_payload: pkt.input_payload,
            port_id: Some(pkt.port),
            apply_actions: vec![Action::Output(PseudoPort::AllPorts)],
        }
    }
}

#[async_trait]
impl OfpController for RepeaterHub {
    type Message = Message;

    async fn on_connected(&self, channel: &Channel<Message>) {
        match channel
            .send_request(Message::FeaturesReq, Some(FEATURES_DEADLINE))
            .await
        {
            Ok(Message::FeaturesReply(features)) => info!(
                channel = channel.id(),
                datapath_id = %format!("{:016x}", features.datapath_id),
                ports = features.ports.len(),
                "switch connected"
            ),
            Ok(other) => warn!(channel = channel.id(), reply = ?other, "unexpected features reply"),
            Err(error) => warn!(channel = channel.id(), %error, "features request failed"),
        }
    }

    async fn on_message(&self, channel: &Channel<Message>, message: Message) {
        match message {
            Message::PacketIn(pkt) => {
                debug!(channel = channel.id(), in_port = pkt.port, len = pkt.total_len, "flooding packet");
                if let Err(error) = channel.send(Message::PacketOut(Self::flood(pkt))).await {
                    warn!(channel = channel.id(), %error, "packet out failed");
                }
            }
            Message::PortStatus(status) => info!(
                channel = channel.id(),
                port = status.desc.port_no,
                reason = ?status.reason,
                "port status changed"
            ),
            Message::Error(err) => warn!(
                channel = channel.id(),
                err_type = err.err_type,
                code = err.code,
                "switch reported error"
            ),
            other => debug!(channel = channel.id(), message = ?other, "ignoring message"),
        }
    }

    async fn on_disconnected(&self, channel: &Channel<Message>, reason: &ChannelError) {
        info!(channel = channel.id(), peer = %channel.peer_addr(), %reason, "switch disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow0x01::{PacketInReason, Payload};

    #[test]
    fn flood_keeps_buffer_and_in_port() {
        let pkt = PacketIn {
            input_payload: Payload::Buffered(12, vec![1, 2, 3]),
            total_len: 3,
            port: 4,
            reason: PacketInReason::NoMatch,
        };
        let out = RepeaterHub::flood(pkt);
        assert_eq!(out.output_payload, Payload::Buffered(12, vec![1, 2, 3]));
        assert_eq!(out.port_id, Some(4));
        assert_eq!(out.apply_actions, vec![Action::Output(PseudoPort::AllPorts)]);
    }
}
