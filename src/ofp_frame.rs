//! Frame reassembly.
//!
//! Incoming bytes accumulate in a single `BytesMut`. The header's length field says how
//! many bytes the frame needs; reads ask for at least the missing amount, so a frame
//! arriving in pieces costs one read per piece rather than one per byte.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ChannelError, ProtocolError, TransportError};
use crate::ofp_header::{OfpHeader, OFP_HEADER_SIZE};

const INITIAL_CAPACITY: usize = 8 * 1024;

/// One complete wire unit: header plus `length - 8` body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: OfpHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: OfpHeader, body: Bytes) -> Self {
        Frame { header, body }
    }

    #[inline]
    pub fn type_code(&self) -> u8 {
        self.header.type_code()
    }

    #[inline]
    pub fn xid(&self) -> u32 {
        self.header.xid()
    }

    /// Wire representation of the whole frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.header.length());
        self.header.marshal(&mut bytes);
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Buffer accumulating incoming bytes and extracting complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        FrameBuffer {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Append data without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes still missing before the next frame is complete.
    ///
    /// Zero means `next_frame` will return a frame.
    pub fn wanted(&self) -> Result<usize, ProtocolError> {
        if self.buffer.len() < OFP_HEADER_SIZE {
            return Ok(OFP_HEADER_SIZE - self.buffer.len());
        }
        let header = OfpHeader::parse(&self.buffer)?;
        Ok(header.length().saturating_sub(self.buffer.len()))
    }

    /// Split the next complete frame off the buffer, if there is one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buffer.len() < OFP_HEADER_SIZE {
            return Ok(None);
        }
        let header = OfpHeader::parse(&self.buffer)?;
        if self.buffer.len() < header.length() {
            return Ok(None);
        }
        let mut frame = self.buffer.split_to(header.length());
        let body = frame.split_off(OFP_HEADER_SIZE).freeze();
        Ok(Some(Frame::new(header, body)))
    }

    /// Push data into the buffer and extract all complete frames.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Read from `reader` until at least `at_least` more bytes are buffered.
    pub async fn fill<R>(&mut self, reader: &mut R, at_least: usize) -> Result<usize, TransportError>
    where
        R: AsyncRead + Unpin,
    {
        self.buffer.reserve(at_least);
        let mut read = 0;
        while read < at_least {
            let n = reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(TransportError::Eof);
            }
            read += n;
        }
        Ok(read)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one complete frame, pulling from `reader` only as much as the frame still needs.
///
/// Bytes past the end of the frame stay in `buffer` for the next call.
pub async fn read_frame<R>(reader: &mut R, buffer: &mut FrameBuffer) -> Result<Frame, ChannelError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = buffer.next_frame()? {
            tracing::trace!(
                type_code = frame.type_code(),
                xid = frame.xid(),
                length = frame.header.length(),
                "frame received"
            );
            return Ok(frame);
        }
        let wanted = buffer.wanted()?;
        buffer.fill(reader, wanted).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn frame_bytes(typ: u8, xid: u32, body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![];
        OfpHeader::new(1, typ, (OFP_HEADER_SIZE + body.len()) as u16, xid).marshal(&mut bytes);
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn reassembles_frame_and_a_half_then_remainder() {
        let first = frame_bytes(10, 1, &[0xaa; 12]);
        let second = frame_bytes(11, 2, &[0xbb; 12]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let cut = first.len() + second.len() / 2;

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&stream[..cut]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_bytes(), first);
        assert_eq!(buffer.wanted().unwrap(), second.len() - second.len() / 2);

        let frames = buffer.push(&stream[cut..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_bytes(), second);
        assert!(buffer.is_empty());
    }

    #[test]
    fn wanted_asks_for_missing_header_bytes_first() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&[1, 0, 0]);
        assert_eq!(buffer.wanted().unwrap(), 5);
    }

    #[test]
    fn header_only_frame_has_empty_body() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&frame_bytes(0, 3, &[])).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].body.is_empty());
    }

    #[test]
    fn corrupt_length_is_a_protocol_error() {
        let mut buffer = FrameBuffer::new();
        let err = buffer.push(&[1, 0, 0, 4, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, ProtocolError::BadLength { length: 4 });
    }

    #[tokio::test]
    async fn read_frame_across_split_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let first = frame_bytes(10, 1, &[1; 20]);
        let second = frame_bytes(10, 2, &[2; 20]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let cut = first.len() + 10;

        let writer = tokio::spawn(async move {
            client.write_all(&stream[..cut]).await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(&stream[cut..]).await.unwrap();
            client
        });

        let mut buffer = FrameBuffer::new();
        let a = read_frame(&mut server, &mut buffer).await.unwrap();
        let b = read_frame(&mut server, &mut buffer).await.unwrap();
        assert_eq!(a.to_bytes(), first);
        assert_eq!(b.to_bytes(), second);
        assert!(buffer.is_empty());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn read_frame_reports_eof_mid_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&frame_bytes(10, 1, &[1; 20])[..12]).await.unwrap();
        drop(client);

        let mut buffer = FrameBuffer::new();
        let err = read_frame(&mut server, &mut buffer).await.unwrap_err();
        assert_eq!(err, ChannelError::Transport(TransportError::Eof));
    }
}
