//! Framing strategies.
//!
//! A [`Decoder`] pulls exactly one frame off a byte stream per call and never
//! reads into the following frame, so the read loop can call it repeatedly on
//! the same reader. Each decoder has a matching [`Encoder`] that produces
//! frames the remote side can decode.

use std::io;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::error::DecodeError;

const MAX_VARINT_BYTES: usize = 5;

#[async_trait]
pub trait Decoder: Send + Sync {
    /// Read one complete frame and return its payload.
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Bytes, DecodeError>;
}

pub trait Encoder: Send + Sync {
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()>;

    fn frame(&self, payload: &[u8]) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(payload.len() + MAX_VARINT_BYTES);
        self.encode(payload, &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Frames are a LEB128 varint length followed by that many payload bytes.
#[derive(Clone, Copy, Debug)]
pub struct LengthPrefixedCodec {
    max_frame_size: usize,
}

impl LengthPrefixedCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[async_trait]
impl Decoder for LengthPrefixedCodec {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Bytes, DecodeError> {
        let len = read_varint(reader).await?;
        if len > self.max_frame_size {
            return Err(DecodeError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

impl Encoder for LengthPrefixedCodec {
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if payload.len() > self.max_frame_size || payload.len() > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "payload of {} bytes exceeds frame limit of {}",
                    payload.len(),
                    self.max_frame_size
                ),
            ));
        }
        dst.reserve(payload.len() + MAX_VARINT_BYTES);
        write_varint(payload.len() as u32, dst);
        dst.put_slice(payload);
        Ok(())
    }
}

/// Frames are terminated by a delimiter byte, newline by default.
///
/// An over-long frame is skipped through its delimiter and reported as
/// [`DecodeError::InvalidFrame`], leaving the stream aligned on the next frame.
#[derive(Clone, Copy, Debug)]
pub struct DelimitedCodec {
    delimiter: u8,
    max_frame_size: usize,
}

impl DelimitedCodec {
    pub fn new(delimiter: u8, max_frame_size: usize) -> Self {
        Self {
            delimiter,
            max_frame_size,
        }
    }

    pub fn lines(max_frame_size: usize) -> Self {
        Self::new(b'\n', max_frame_size)
    }
}

impl Default for DelimitedCodec {
    fn default() -> Self {
        Self::lines(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[async_trait]
impl Decoder for DelimitedCodec {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Bytes, DecodeError> {
        let mut buf = BytesMut::new();
        let mut seen = 0usize;
        loop {
            let byte = match reader.read_u8().await {
                Ok(byte) => byte,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && seen == 0 => {
                    return Err(DecodeError::Eof);
                }
                Err(err) => return Err(err.into()),
            };
            if byte == self.delimiter {
                break;
            }
            seen += 1;
            if seen <= self.max_frame_size {
                buf.put_u8(byte);
            }
        }
        if seen > self.max_frame_size {
            return Err(DecodeError::InvalidFrame(format!(
                "discarded frame of {seen} bytes, limit is {}",
                self.max_frame_size
            )));
        }
        Ok(buf.freeze())
    }
}

impl Encoder for DelimitedCodec {
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if payload.contains(&self.delimiter) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload contains the frame delimiter",
            ));
        }
        if payload.len() > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "payload of {} bytes exceeds frame limit of {}",
                    payload.len(),
                    self.max_frame_size
                ),
            ));
        }
        dst.reserve(payload.len() + 1);
        dst.put_slice(payload);
        dst.put_u8(self.delimiter);
        Ok(())
    }
}

async fn read_varint(reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<usize, DecodeError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    for index in 0..MAX_VARINT_BYTES {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && index == 0 => {
                return Err(DecodeError::Eof);
            }
            Err(err) => return Err(err.into()),
        };
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result as usize);
        }
        shift += 7;
    }
    Err(DecodeError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        "length prefix longer than 5 bytes",
    )))
}

fn write_varint(value: u32, buf: &mut BytesMut) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if val == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn decodes_consecutive_frames_without_over_reading() {
        let codec = LengthPrefixedCodec::default();
        let (mut client, mut server) = duplex(64);
        let mut wire = BytesMut::new();
        codec.encode(b"ping", &mut wire).unwrap();
        codec.encode(b"", &mut wire).unwrap();
        codec.encode(&[7u8; 200], &mut wire).unwrap();

        let writer = tokio::spawn(async move {
            client.write_all(&wire).await.expect("write");
        });

        assert_eq!(&codec.decode(&mut server).await.unwrap()[..], b"ping");
        assert!(codec.decode(&mut server).await.unwrap().is_empty());
        assert_eq!(codec.decode(&mut server).await.unwrap().len(), 200);
        writer.await.unwrap();
        assert!(matches!(codec.decode(&mut server).await, Err(DecodeError::Eof)));
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_an_io_error() {
        let codec = LengthPrefixedCodec::default();
        let mut reader: &[u8] = &[5, b'a', b'b'];
        match codec.decode(&mut reader).await {
            Err(DecodeError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_oversized_length_prefix() {
        let codec = LengthPrefixedCodec::new(16);
        let mut wire = BytesMut::new();
        write_varint(17, &mut wire);
        wire.put_slice(&[0u8; 17]);
        let mut reader: &[u8] = &wire;
        let err = codec.decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, DecodeError::FrameTooLarge { size: 17, max: 16 }));
        assert!(!err.is_recoverable());
        assert!(codec.encode(&[0u8; 17], &mut BytesMut::new()).is_err());
    }

    #[tokio::test]
    async fn rejects_runaway_varint() {
        let codec = LengthPrefixedCodec::default();
        let mut reader: &[u8] = &[0xFF; 8];
        assert!(matches!(
            codec.decode(&mut reader).await,
            Err(DecodeError::Io(_))
        ));
    }

    #[tokio::test]
    async fn delimited_skips_oversized_frame_and_recovers() {
        let codec = DelimitedCodec::lines(4);
        let mut reader: &[u8] = b"this line is too long\nok\n\n";
        let err = codec.decode(&mut reader).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(&codec.decode(&mut reader).await.unwrap()[..], b"ok");
        assert!(codec.decode(&mut reader).await.unwrap().is_empty());
        assert!(matches!(codec.decode(&mut reader).await, Err(DecodeError::Eof)));
    }

    #[tokio::test]
    async fn delimited_partial_frame_at_eof_is_fatal() {
        let codec = DelimitedCodec::default();
        let mut reader: &[u8] = b"dangling";
        let err = codec.decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
        assert!(codec.frame(b"a\nb").is_err());
    }

    fn decode_all<D: Decoder>(codec: &D, wire: &[u8], count: usize) -> Vec<Vec<u8>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let mut reader: &[u8] = wire;
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(codec.decode(&mut reader).await.expect("decode").to_vec());
            }
            assert!(matches!(codec.decode(&mut reader).await, Err(DecodeError::Eof)));
            out
        })
    }

    proptest! {
        #[test]
        fn length_prefixed_stream_decodes_in_order(
            frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..16)
        ) {
            let codec = LengthPrefixedCodec::default();
            let mut wire = BytesMut::new();
            for frame in &frames {
                codec.encode(frame, &mut wire).unwrap();
            }
            prop_assert_eq!(decode_all(&codec, &wire, frames.len()), frames);
        }

        #[test]
        fn delimited_stream_decodes_in_order(
            frames in prop::collection::vec(prop::collection::vec(1u8..=255, 0..64), 0..16)
        ) {
            let codec = DelimitedCodec::new(0, 1024);
            let mut wire = BytesMut::new();
            for frame in &frames {
                codec.encode(frame, &mut wire).unwrap();
            }
            prop_assert_eq!(decode_all(&codec, &wire, frames.len()), frames);
        }
    }
}
