//! Framed codec for worker process communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! The pool is thread-based, so frames are moved over plain blocking
//! `std::io` pipes through [`FrameReader`] and [`FrameWriter`].

use std::io::{self, Read, Write};
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are logged; verification messages are small.
const LARGE_FRAME_BYTES: usize = 64 * 1024;

/// Largest frame either side will encode or accept.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Codec that frames messages with length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > LARGE_FRAME_BYTES {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Blocking reader yielding one decoded message per frame.
pub struct FrameReader<R, T> {
    reader: R,
    codec: JsonCodec<T>,
    buf: BytesMut,
}

impl<R: Read, T: DeserializeOwned> FrameReader<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            codec: JsonCodec::new(),
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the next message.
    ///
    /// `Ok(None)` means the peer closed the pipe on a frame boundary; a close
    /// in the middle of a frame is `UnexpectedEof`.
    pub fn read(&mut self) -> io::Result<Option<T>> {
        let mut chunk = [0u8; 8 * 1024];
        loop {
            if let Some(item) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(item));
            }
            let n = match self.reader.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("pipe closed with {} bytes of partial frame", self.buf.len()),
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Blocking writer encoding one message per frame, flushed on every send.
pub struct FrameWriter<W, T> {
    writer: W,
    codec: JsonCodec<T>,
    buf: BytesMut,
}

impl<W: Write, T: Serialize> FrameWriter<W, T> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            codec: JsonCodec::new(),
            buf: BytesMut::new(),
        }
    }

    pub fn send(&mut self, item: T) -> io::Result<()> {
        self.encode(item)?;
        self.write_encoded()
    }

    /// Encode `item` into the pending frame without touching the pipe.
    ///
    /// Fails with `InvalidInput` above [`MAX_FRAME_BYTES`] and `InvalidData`
    /// when the item does not serialize. Neither says anything about the peer.
    pub fn encode(&mut self, item: T) -> io::Result<()> {
        self.buf.clear();
        if let Err(e) = self.codec.encode(item, &mut self.buf) {
            self.buf.clear();
            return Err(e);
        }
        Ok(())
    }

    /// Write and flush the frame produced by the last [`encode`](Self::encode).
    pub fn write_encoded(&mut self) -> io::Result<()> {
        self.writer.write_all(&self.buf)?;
        self.buf.clear();
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
    use crate::job::JobId;
    use crate::verifier::{VerificationError, VerifyRequest};

    #[test]
    fn codec_roundtrip_worker_request() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();

        let id = JobId::new();
        let req = WorkerRequest::Verify {
            id,
            request: VerifyRequest::new("assertion").with_audience("https://rp.example"),
        };
        codec.encode(req, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        match decoded {
            WorkerRequest::Verify { id: got, request } => {
                assert_eq!(got, id);
                assert_eq!(request.audience.as_deref(), Some("https://rp.example"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut full = BytesMut::new();
        codec.encode(WorkerRequest::Shutdown, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn frames_cross_a_pipe_in_order() {
        let mut writer = FrameWriter::<_, WorkerResponse>::new(Vec::new());
        let id = JobId::new();
        writer.send(WorkerResponse::ShuttingDown).unwrap();
        writer
            .send(WorkerResponse::Failed {
                id,
                error: VerificationError::Expired("stale".into()),
            })
            .unwrap();
        let bytes = writer.into_inner();

        let mut reader = FrameReader::<_, WorkerResponse>::new(bytes.as_slice());
        assert!(matches!(
            reader.read().unwrap(),
            Some(WorkerResponse::ShuttingDown)
        ));
        match reader.read().unwrap() {
            Some(WorkerResponse::Failed { id: got, error }) => {
                assert_eq!(got, id);
                assert_eq!(error, VerificationError::Expired("stale".into()));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_unexpected_eof() {
        let mut writer = FrameWriter::<_, WorkerRequest>::new(Vec::new());
        writer.send(WorkerRequest::Shutdown).unwrap();
        let bytes = writer.into_inner();

        let mut reader = FrameReader::<_, WorkerRequest>::new(&bytes[..bytes.len() - 2]);
        let err = reader.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_is_rejected_before_writing() {
        let mut writer = FrameWriter::<_, WorkerRequest>::new(Vec::new());
        let huge = "a".repeat(MAX_FRAME_BYTES + 1);
        let err = writer
            .send(WorkerRequest::Verify {
                id: JobId::new(),
                request: VerifyRequest::new(huge),
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // Nothing reached the pipe, and the writer is still usable.
        writer.send(WorkerRequest::Shutdown).unwrap();
        let bytes = writer.into_inner();
        let mut reader = FrameReader::<_, WorkerRequest>::new(bytes.as_slice());
        assert!(matches!(reader.read().unwrap(), Some(WorkerRequest::Shutdown)));
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn garbage_frame_is_invalid_data() {
        let mut bytes = 5u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"nope!");

        let mut reader = FrameReader::<_, WorkerRequest>::new(bytes.as_slice());
        let err = reader.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
