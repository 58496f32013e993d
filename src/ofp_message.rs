use std::collections::HashMap;
use std::fmt;

use crate::error::{DecodeError, ProtocolError};
use crate::ofp_header::{OfpHeader, OFP_HEADER_SIZE};

/// OpenFlow Message
///
/// Version-agnostic API for handling OpenFlow messages at the byte-buffer level.
pub trait OfpMessage: Send + Sync + 'static {
    /// Return the wire type code identifying this message.
    fn msg_code(&self) -> u8;

    /// Append the message body, everything after the header, to `bytes`.
    fn marshal_body(&self, bytes: &mut Vec<u8>);

    /// Return a marshaled buffer containing an OpenFlow header and the message.
    fn marshal(&self, version: u8, xid: u32) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = vec![0; OFP_HEADER_SIZE];
        self.marshal_body(&mut bytes);
        let length = u16::try_from(bytes.len()).map_err(|_| ProtocolError::FrameTooLarge {
            length: bytes.len(),
        })?;
        let header = OfpHeader::new(version, self.msg_code(), length, xid);
        bytes[..OFP_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        Ok(bytes)
    }
}

/// A message carried as its type code and undecoded body.
///
/// Useful when an application only routes frames, and as the message type of a codec
/// that knows nothing about concrete bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub type_code: u8,
    pub body: Vec<u8>,
}

impl RawMessage {
    pub fn new(type_code: u8, body: Vec<u8>) -> Self {
        RawMessage { type_code, body }
    }

    /// Decoder usable with `MessageCodec::register` for any type code.
    pub fn parse(header: &OfpHeader, body: &[u8]) -> Result<RawMessage, DecodeError> {
        Ok(RawMessage::new(header.type_code(), body.to_vec()))
    }
}

impl OfpMessage for RawMessage {
    fn msg_code(&self) -> u8 {
        self.type_code
    }

    fn marshal_body(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.body);
    }
}

type Decoder<M> = Box<dyn Fn(&OfpHeader, &[u8]) -> Result<M, DecodeError> + Send + Sync>;

/// Dispatch table from wire type codes to decoders.
///
/// Message kinds are added by registration, so supporting a new kind never touches the
/// engine. The table also records which type code answers which request, which is what
/// the transaction registry checks replies against.
pub struct MessageCodec<M> {
    decoders: HashMap<u8, Decoder<M>>,
    replies: HashMap<u8, u8>,
}

impl<M: OfpMessage> MessageCodec<M> {
    pub fn new() -> Self {
        MessageCodec {
            decoders: HashMap::new(),
            replies: HashMap::new(),
        }
    }

    /// Register the decoder for `type_code`, replacing any previous one.
    pub fn register<F>(&mut self, type_code: u8, decoder: F) -> &mut Self
    where
        F: Fn(&OfpHeader, &[u8]) -> Result<M, DecodeError> + Send + Sync + 'static,
    {
        self.decoders.insert(type_code, Box::new(decoder));
        self
    }

    /// Record that `reply` is the answer to a `request`.
    pub fn register_reply(&mut self, request: u8, reply: u8) -> &mut Self {
        self.replies.insert(request, reply);
        self
    }

    /// Type code of the reply a `request` expects, if it is a request at all.
    pub fn expected_reply(&self, request: u8) -> Option<u8> {
        self.replies.get(&request).copied()
    }

    /// Whether `type_code` answers some request.
    pub fn is_reply(&self, type_code: u8) -> bool {
        self.replies.values().any(|&r| r == type_code)
    }

    /// Every type code registered as the reply to some request.
    pub fn reply_kinds(&self) -> impl Iterator<Item = u8> + '_ {
        self.replies.values().copied()
    }

    /// Whether a decoder is registered for `type_code`.
    pub fn is_registered(&self, type_code: u8) -> bool {
        self.decoders.contains_key(&type_code)
    }

    /// Decode a frame body. `Ok(None)` means no decoder is registered for its type.
    pub fn decode(&self, header: &OfpHeader, body: &[u8]) -> Result<Option<M>, DecodeError> {
        match self.decoders.get(&header.type_code()) {
            Some(decoder) => decoder(header, body).map(Some),
            None => Ok(None),
        }
    }
}

impl<M: OfpMessage> Default for MessageCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for MessageCodec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut decoders: Vec<_> = self.decoders.keys().copied().collect();
        decoders.sort_unstable();
        f.debug_struct("MessageCodec")
            .field("decoders", &decoders)
            .field("replies", &self.replies)
            .finish()
    }
}
