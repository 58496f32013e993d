//! OpenFlow connection engine.
//!
//! Negotiates the protocol version with each switch, splits the byte stream into frames,
//! answers keepalives, matches replies to pending requests by xid and writes outgoing
//! messages in submission order. Applications implement `OfpController` and talk to each
//! switch through its `Channel`.

mod bits;
pub mod channel;
pub mod config;
mod demux;
pub mod error;
pub mod logging;
pub mod negotiation;
pub mod ofp_controller;
pub mod ofp_frame;
pub mod ofp_header;
pub mod ofp_message;
pub mod openflow0x01;
pub mod repeater_hub;
pub mod transaction;
pub mod write_queue;

pub use channel::{Channel, ChannelState};
pub use config::{ChannelConfig, ControllerConfig};
pub use error::{
    ChannelError, NegotiationError, OfpError, ProtocolError, TransactionError, TransportError,
};
pub use ofp_controller::{serve_connection, Controller, OfpController};
pub use ofp_message::{MessageCodec, OfpMessage, RawMessage};
