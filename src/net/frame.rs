//! Length-prefixed framing for the TCP transport.
//!
//! Every frame starts with a fixed header: payload length (u32), signal id
//! (u16) and correlation id (u32), all big-endian. Responses echo the signal
//! and correlation id of their request; pushed invalidations use correlation 0.

use crate::core::error::{Error, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the frame header in bytes
pub const FRAME_HEADER_LEN: usize = 10;

/// Correlation id of frames the server sends unprompted
pub const PUSH_CORRELATION: u32 = 0;

/// One framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Signal id
    pub signal: u16,
    /// Request this frame belongs to
    pub correlation: u32,
    /// Encoded request, response or push
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(signal: u16, correlation: u32, payload: Bytes) -> Self {
        Self { signal, correlation, payload }
    }

    /// Encode header and payload, refusing payloads over `max_frame_size`
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes> {
        check_size(self.payload.len(), max_frame_size)?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.signal);
        buf.put_u32(self.correlation);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

fn check_size(size: usize, max_size: usize) -> Result<()> {
    if size > max_size || size > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge { size, max_size }.into());
    }
    Ok(())
}

fn parse_header(header: &[u8; FRAME_HEADER_LEN]) -> (usize, u16, u32) {
    let mut cursor = &header[..];
    let length = cursor.get_u32() as usize;
    let signal = cursor.get_u16();
    let correlation = cursor.get_u32();
    (length, signal, correlation)
}

fn truncated(what: &str) -> Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("frame {} truncated", what)).into()
}

/// Read the next frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(truncated("header"));
        }
        read += n;
    }

    let (length, signal, correlation) = parse_header(&header);
    check_size(length, max_frame_size)?;
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => truncated("payload"),
        _ => err.into(),
    })?;
    Ok(Some(Frame::new(signal, correlation, Bytes::from(payload))))
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode(max_frame_size)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking frame reader used by the client transport
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: usize,
}

impl<R: Read> FrameReader<R> {
    /// Wrap `reader`
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self { reader, max_frame_size }
    }

    /// Read the next frame; `None` on a clean end of stream
    pub fn read_next(&mut self) -> Result<Option<Frame>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(truncated("header"));
            }
            read += n;
        }

        let (length, signal, correlation) = parse_header(&header);
        check_size(length, self.max_frame_size)?;
        let mut payload = vec![0u8; length];
        self.reader.read_exact(&mut payload).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => truncated("payload"),
            _ => err.into(),
        })?;
        Ok(Some(Frame::new(signal, correlation, Bytes::from(payload))))
    }
}

/// Blocking counterpart of [`write_frame`]
pub fn write_frame_blocking<W: Write>(writer: &mut W, frame: &Frame, max_frame_size: usize) -> Result<()> {
    let encoded = frame.encode(max_frame_size)?;
    writer.write_all(&encoded)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_layout_is_big_endian() {
        let frame = Frame::new(5, 0x0102_0304, Bytes::from_static(b"xy"));
        let encoded = frame.encode(1024).unwrap();
        assert_eq!(&encoded[..], &[0, 0, 0, 2, 0, 5, 1, 2, 3, 4, b'x', b'y']);
    }

    #[test]
    fn blocking_reader_splits_consecutive_frames() {
        let mut wire = Vec::new();
        write_frame_blocking(&mut wire, &Frame::new(1, 1, Bytes::from_static(b"alice")), 1024).unwrap();
        write_frame_blocking(&mut wire, &Frame::new(2, 2, Bytes::new()), 1024).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire), 1024);
        assert_eq!(reader.read_next().unwrap().unwrap().payload, Bytes::from_static(b"alice"));
        let empty = reader.read_next().unwrap().unwrap();
        assert_eq!((empty.signal, empty.correlation), (2, 2));
        assert!(empty.payload.is_empty());
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn oversized_frames_are_refused_both_ways() {
        let frame = Frame::new(1, 1, Bytes::from(vec![0u8; 64]));
        assert!(matches!(
            frame.encode(32),
            Err(Error::Protocol(ProtocolError::FrameTooLarge { size: 64, max_size: 32 }))
        ));

        let encoded = frame.encode(1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(encoded.to_vec()), 32);
        let err = reader.read_next().unwrap_err();
        assert!(err.is_fatal_to_session());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let encoded = Frame::new(1, 1, Bytes::from_static(b"abcdef")).encode(1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(encoded[..encoded.len() - 2].to_vec()), 1024);
        assert!(matches!(reader.read_next(), Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn async_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let frame = Frame::new(7, 42, Bytes::from_static(b"commit"));
        write_frame(&mut client, &frame, 1024).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), Some(frame));
        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn header_split_across_reads() {
        let encoded = Frame::new(3, 9, Bytes::from_static(b"view")).encode(1024).unwrap();
        let mut mock = tokio_test::io::Builder::new()
            .read(&encoded[..4])
            .read(&encoded[4..10])
            .read(&encoded[10..])
            .build();

        let frame = read_frame(&mut mock, 1024).await.unwrap().unwrap();
        assert_eq!((frame.signal, frame.correlation), (3, 9));
        assert_eq!(frame.payload, Bytes::from_static(b"view"));
    }
}
