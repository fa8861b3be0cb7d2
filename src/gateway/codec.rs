use flate2::{Decompress, FlushDecompress, Status};

use super::etf;
use super::events::GatewayPayload;
use crate::error::CodecError;

/// Marks the end of one logical message in a zlib-stream.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Encodes outbound payloads and reassembles inbound zlib-stream frames.
///
/// The inflate context lives as long as the socket: every message is
/// compressed against the dictionary built by the ones before it.
pub struct FrameCodec {
    inflater: Decompress,
    buffer: Vec<u8>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    pub fn encode(payload: &GatewayPayload) -> Result<Vec<u8>, CodecError> {
        let value = serde_json::to_value(payload)?;
        Ok(etf::encode(&value))
    }

    /// Feed one websocket frame. Returns `Ok(None)` until a frame ending in
    /// the flush marker completes the message.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<GatewayPayload>, CodecError> {
        self.buffer.extend_from_slice(chunk);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let compressed = std::mem::take(&mut self.buffer);
        let raw = self.inflate(&compressed)?;
        let value = etf::decode(&raw)?;
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Bytes waiting for a flush marker.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn inflate(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(input.len() * 4 + 64);
        let mut offset = 0;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(1024));
            }

            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();
            let status =
                self.inflater
                    .decompress_vec(&input[offset..], &mut out, FlushDecompress::Sync)?;
            let consumed = (self.inflater.total_in() - in_before) as usize;
            let produced = self.inflater.total_out() - out_before;
            offset += consumed;

            if status == Status::StreamEnd {
                break;
            }
            if offset >= input.len() && out.len() < out.capacity() {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }

        Ok(out)
    }
}
