//! Length-prefixed JSON framing for control messages.
//!
//! A `LengthDelimitedCodec` extracts whole frames; serde turns them into
//! typed messages. Works over any `AsyncRead`/`AsyncWrite` pair, which in
//! practice means child stdio pipes in production and in-memory duplex
//! streams in tests.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames messages with a 4-byte length prefix and JSON bodies.
///
/// Decoding stops at frame extraction and yields raw bytes: `FramedRead`
/// treats any decoder error as terminal, so a per-message protocol
/// violation must never surface here. Callers parse each frame with
/// [`FrameCodec::parse`] and decide what to do with a body that does not
/// deserialize.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> FrameCodec<T> {
    /// Parse one extracted frame body into a typed message.
    pub fn parse(frame: &BytesMut) -> Result<T, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

impl<T> Decoder for FrameCodec<T> {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode(src)
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = body.len(), "encoding control frame");
        self.inner.encode(Bytes::from(body), dst)
    }
}
