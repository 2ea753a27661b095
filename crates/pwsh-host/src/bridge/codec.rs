//! Framed codec for the host channel.
//!
//! Wire format, client side of a strict request/response protocol:
//! - requests are a single opcode byte, followed for EXECUTE by one
//!   length-prefixed UTF-8 frame carrying the wrapped command text;
//! - the response is one length-prefixed frame (or a zero-length marker
//!   meaning "no response body").
//!
//! Length prefixes are 4-byte **little-endian** u32. Framing is delegated to
//! `LengthDelimitedCodec`, which absorbs partial reads until a whole frame is
//! buffered.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::HostRequest;

/// Append one length-prefixed UTF-8 frame to `dst`.
pub fn encode_frame(dst: &mut BytesMut, payload: &str) {
    let bytes = payload.as_bytes();
    dst.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    dst.extend_from_slice(bytes);
}

/// Codec speaking the manager side of the host protocol.
///
/// Asymmetric by design: the manager only ever encodes [`HostRequest`]s and
/// only ever decodes raw response frame payloads; interpretation of the
/// payload lives in [`super::protocol`].
#[derive(Debug)]
pub struct HostCodec {
    inner: LengthDelimitedCodec,
}

impl Default for HostCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .little_endian()
                .new_codec(),
        }
    }
}

impl Decoder for HostCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                tracing::trace!(frame_len = frame.len(), "Decoded response frame");
                Ok(Some(frame.freeze()))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<HostRequest> for HostCodec {
    type Error = io::Error;

    fn encode(&mut self, item: HostRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // The opcode byte rides in front of the frame, with no length prefix
        // of its own.
        dst.extend_from_slice(&[item.opcode()]);
        match item {
            HostRequest::Exit => {
                tracing::trace!("Encoding EXIT request");
            }
            HostRequest::Execute(payload) => {
                tracing::trace!(payload_len = payload.len(), "Encoding EXECUTE request");
                encode_frame(dst, &payload);
            }
        }
        Ok(())
    }
}
