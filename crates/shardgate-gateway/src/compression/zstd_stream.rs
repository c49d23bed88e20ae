//! zstd-stream decompression
//!
//! Frames are fed to a streaming decoder as they arrive; every block the
//! decoder flushes is appended to the pending message.

use super::{CodecError, CodecStats, StreamDecompressor};
use ::zstd::stream::raw::{Decoder, InBuffer, Operation, OutBuffer};

/// Largest block the decoder flushes in one step
const OUTPUT_BLOCK: usize = 128 * 1024;

/// Connection-scoped zstd decoder
pub struct ZstdStream {
    decoder: Decoder<'static>,
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    stats: CodecStats,
}

impl ZstdStream {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = Decoder::new().map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Self {
            decoder,
            buffer: Vec::new(),
            scratch: vec![0; OUTPUT_BLOCK],
            stats: CodecStats::default(),
        })
    }
}

impl StreamDecompressor for ZstdStream {
    fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        self.stats.bytes_read += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        let mut input = InBuffer::around(&self.buffer);
        let mut message = Vec::new();
        let mut produced = false;
        let mut frame_done = false;

        loop {
            let before = input.pos;
            let (hint, written) = {
                let mut output = OutBuffer::around(&mut self.scratch[..]);
                let hint = self
                    .decoder
                    .run(&mut input, &mut output)
                    .map_err(|e| CodecError::Zstd(e.to_string()))?;
                (hint, output.pos())
            };

            if written > 0 {
                message.extend_from_slice(&self.scratch[..written]);
                produced = true;
            }
            if hint == 0 {
                frame_done = true;
                self.stats.frames_processed += 1;
            }

            // A full output block may leave more data inside the decoder
            if written == OUTPUT_BLOCK {
                continue;
            }
            if input.pos >= self.buffer.len() || (input.pos == before && written == 0) {
                break;
            }
        }

        let consumed = input.pos;
        self.buffer.drain(..consumed);

        if produced || frame_done {
            self.stats.bytes_written += message.len() as u64;
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.buffer.clear();
        self.stats = CodecStats::default();
        self.decoder
            .reinit()
            .map_err(|e| CodecError::Zstd(e.to_string()))
    }

    fn stats(&self) -> CodecStats {
        self.stats
    }
}
