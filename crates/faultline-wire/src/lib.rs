#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **faultline-wire** – Serialization boundary of the Faultline pipeline.
//!
//! Three codecs live here: the envelope codec both ends of the transport
//! agree on (UTF-8 JSON, zlib-deflated), the at-rest blob codec for the
//! `event.data` column (the same compression, base64-armored to survive a
//! TEXT column), and the length-prefixed frame codec that carries opaque
//! envelope bytes over TCP.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use faultline_types::Envelope;

/// Upper bound on a single wire frame, enforced on decode.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures at the serialization boundary.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// zlib compression or decompression failed.
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
    /// JSON serialization or parsing failed.
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    /// The base64 armor of an at-rest blob was invalid.
    #[error("invalid blob armor: {0}")]
    Armor(#[from] base64::DecodeError),
    /// An incoming frame announced a length above [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds the {} byte limit", MAX_FRAME_SIZE)]
    FrameTooLarge(usize),
}

//─────────────────────────────
//  Envelope codec
//─────────────────────────────

/// Serialize an envelope for the wire: JSON, then zlib deflate.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    deflate(&serde_json::to_vec(envelope)?)
}

/// Decode a wire frame back into an envelope: inflate, then parse.
pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    Ok(serde_json::from_slice(&inflate(bytes)?)?)
}

//─────────────────────────────
//  At-rest blob codec
//─────────────────────────────

/// Encode a JSON value for a TEXT column: zlib-deflated JSON, base64-armored.
pub fn encode_blob(value: &Value) -> Result<String, WireError> {
    Ok(BASE64.encode(deflate(&serde_json::to_vec(value)?)?))
}

/// Decode an at-rest blob. An empty column decodes to an empty object.
pub fn decode_blob(armored: &str) -> Result<Value, WireError> {
    if armored.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    Ok(serde_json::from_slice(&inflate(&BASE64.decode(armored)?)?)?)
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

//─────────────────────────────
//  Transport frame codec
//─────────────────────────────

/// u32-big-endian length-prefixed framing for opaque envelope bytes.
///
/// The frame body is exactly what [`encode`] produced; the codec adds no
/// structure of its own beyond the length prefix.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(body.len()));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}
