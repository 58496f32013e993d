//! Version negotiation.
//!
//! Both ends open with a HELLO. The hello may carry a version bitmap element listing every
//! version its sender accepts; without one, the sender accepts its header version and
//! everything below. The connection runs the highest version both sides accept, or is
//! refused with a HELLO_FAILED/INCOMPATIBLE error.

use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;
use tokio::io::AsyncRead;

use crate::bits::{set_word_bit, test_word_bit, word_bits};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, NegotiationError, ProtocolError};
use crate::ofp_frame::{read_frame, Frame, FrameBuffer};
use crate::ofp_header::type_code;
use crate::ofp_message::{OfpMessage, RawMessage};
use crate::write_queue::WriteQueue;

/// Hello element type of the version bitmap.
pub const OFPHET_VERSIONBITMAP: u16 = 1;

/// Error type for a failed hello exchange.
pub const OFPET_HELLO_FAILED: u16 = 0;

/// Error code for "no common version".
pub const OFPHFC_INCOMPATIBLE: u16 = 0;

const ELEMENT_HEADER_SIZE: usize = 4;

/// Set of protocol versions, stored the way the bitmap element carries it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionBitmap {
    words: Vec<u32>,
}

impl VersionBitmap {
    pub fn from_versions<I>(versions: I) -> VersionBitmap
    where
        I: IntoIterator<Item = u8>,
    {
        let mut words = vec![];
        for version in versions {
            set_word_bit(&mut words, version as usize);
        }
        VersionBitmap { words }
    }

    pub fn from_words(words: Vec<u32>) -> VersionBitmap {
        VersionBitmap { words }
    }

    /// Every version up to and including `version`.
    pub fn up_to(version: u8) -> VersionBitmap {
        Self::from_versions(1..=version)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn contains(&self, version: u8) -> bool {
        test_word_bit(&self.words, version as usize)
    }

    /// Versions in the set, ascending.
    pub fn versions(&self) -> Vec<u8> {
        word_bits(&self.words)
            .filter_map(|bit| u8::try_from(bit).ok())
            .collect()
    }

    /// Highest version present in both sets.
    pub fn highest_common(&self, other: &VersionBitmap) -> Option<u8> {
        self.versions()
            .into_iter()
            .rev()
            .find(|&version| other.contains(version))
    }
}

/// A HELLO message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Version in the hello's header.
    pub version: u8,
    pub bitmap: Option<VersionBitmap>,
}

impl Hello {
    /// The hello we open a connection with.
    pub fn local(config: &ChannelConfig) -> Hello {
        Hello {
            version: config.highest_version(),
            bitmap: if config.advertise_bitmap {
                Some(VersionBitmap::from_versions(config.versions.iter().copied()))
            } else {
                None
            },
        }
    }

    /// Parse a received frame, which must be a HELLO.
    ///
    /// Unknown element types are skipped.
    pub fn parse(frame: &Frame) -> Result<Hello, ProtocolError> {
        if frame.type_code() != type_code::HELLO {
            return Err(ProtocolError::MalformedHandshake(format!(
                "expected hello, got message type {}",
                frame.type_code()
            )));
        }

        let mut bitmap = None;
        let mut rest = &frame.body[..];
        while rest.len() >= ELEMENT_HEADER_SIZE {
            let typ = BigEndian::read_u16(&rest[0..2]);
            let length = BigEndian::read_u16(&rest[2..4]) as usize;
            if length < ELEMENT_HEADER_SIZE || length > rest.len() {
                return Err(ProtocolError::MalformedHandshake(format!(
                    "hello element length {} with {} bytes remaining",
                    length,
                    rest.len()
                )));
            }
            let payload = &rest[ELEMENT_HEADER_SIZE..length];
            if typ == OFPHET_VERSIONBITMAP {
                if payload.len() % 4 != 0 {
                    return Err(ProtocolError::MalformedHandshake(format!(
                        "version bitmap of {} bytes is not a whole number of words",
                        payload.len()
                    )));
                }
                let words = payload.chunks_exact(4).map(BigEndian::read_u32).collect();
                bitmap = Some(VersionBitmap::from_words(words));
            }
            rest = &rest[padded(length).min(rest.len())..];
        }

        Ok(Hello {
            version: frame.header.version(),
            bitmap,
        })
    }

    /// Versions the sender of this hello accepts.
    pub fn versions(&self) -> VersionBitmap {
        match &self.bitmap {
            Some(bitmap) => bitmap.clone(),
            None => VersionBitmap::up_to(self.version),
        }
    }
}

impl OfpMessage for Hello {
    fn msg_code(&self) -> u8 {
        type_code::HELLO
    }

    fn marshal_body(&self, bytes: &mut Vec<u8>) {
        if let Some(bitmap) = &self.bitmap {
            let length = ELEMENT_HEADER_SIZE + 4 * bitmap.words.len();
            bytes.put_u16(OFPHET_VERSIONBITMAP);
            bytes.put_u16(length as u16);
            for &word in &bitmap.words {
                bytes.put_u32(word);
            }
            bytes.put_bytes(0, padded(length) - length);
        }
    }
}

/// Hello elements are padded to a multiple of 8 bytes.
fn padded(length: usize) -> usize {
    (length + 7) / 8 * 8
}

/// Body of the HELLO_FAILED/INCOMPATIBLE error: type, code, then a readable explanation.
fn incompatible_error(local: &[u8], peer: &[u8]) -> RawMessage {
    let mut body: Vec<u8> = vec![];
    body.put_u16(OFPET_HELLO_FAILED);
    body.put_u16(OFPHFC_INCOMPATIBLE);
    body.extend_from_slice(
        format!("no common version: supported {:?}, offered {:?}", local, peer).as_bytes(),
    );
    RawMessage::new(type_code::ERROR, body)
}

/// Run the hello exchange on a fresh connection and return the negotiated version.
///
/// Our hello goes out through `writes`; the peer's hello is read from `reader`, leaving any
/// bytes that follow it in `buffer`. On failure the caller is expected to close the
/// connection; an incompatible peer has already been sent the error frame.
pub async fn negotiate<R>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
    writes: &WriteQueue,
    config: &ChannelConfig,
    xid: u32,
) -> Result<u8, NegotiationError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(
        config.negotiation_timeout,
        exchange_hellos(reader, buffer, writes, config, xid),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(NegotiationError::Timeout),
    }
}

async fn exchange_hellos<R>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
    writes: &WriteQueue,
    config: &ChannelConfig,
    xid: u32,
) -> Result<u8, NegotiationError>
where
    R: AsyncRead + Unpin,
{
    let local = Hello::local(config);
    writes.submit(local.marshal(local.version, xid)?).await?;
    tracing::trace!(version = local.version, bitmap = ?local.bitmap, "hello sent");

    let frame = read_frame(reader, buffer).await.map_err(|error| match error {
        ChannelError::Protocol(ProtocolError::BadLength { length }) => {
            NegotiationError::Protocol(ProtocolError::MalformedHandshake(format!(
                "hello header length {length}"
            )))
        }
        other => NegotiationError::from(other),
    })?;
    let hello = Hello::parse(&frame)?;
    let peer = hello.versions();
    tracing::debug!(
        header_version = hello.version,
        versions = ?peer.versions(),
        "hello received"
    );

    let ours = VersionBitmap::from_versions(config.versions.iter().copied());
    match ours.highest_common(&peer) {
        Some(version) => Ok(version),
        None => {
            let error = incompatible_error(&config.versions, &peer.versions());
            writes
                .submit(error.marshal(local.version, frame.xid())?)
                .await?;
            Err(ProtocolError::Incompatible {
                local: config.versions.clone(),
                peer: peer.versions(),
            }
            .into())
        }
    }
}
