//! zlib-stream decompression
//!
//! The gateway compresses the whole connection as one zlib stream and
//! sync-flushes at the end of each message, so a message is complete when
//! the buffered input ends with the `00 00 FF FF` flush marker.

use super::{CodecError, CodecStats, StreamDecompressor, CHUNK_SIZE};
use flate2::{Decompress, FlushDecompress, Status};

/// Sync-flush marker terminating every message
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Connection-scoped zlib inflater
pub struct ZlibStream {
    inflate: Decompress,
    buffer: Vec<u8>,
    stats: CodecStats,
}

impl ZlibStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(true),
            buffer: Vec::new(),
            stats: CodecStats::default(),
        }
    }

    /// Compressed bytes waiting for a flush marker
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn inflate_buffer(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut output = Vec::with_capacity(CHUNK_SIZE);
        let mut consumed = 0usize;

        loop {
            if output.len() == output.capacity() {
                output.reserve(CHUNK_SIZE);
            }

            let in_before = self.inflate.total_in();
            let out_before = self.inflate.total_out();
            let status = self
                .inflate
                .decompress_vec(&self.buffer[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| CodecError::Inflate(e.to_string()))?;
            consumed += (self.inflate.total_in() - in_before) as usize;
            let progressed =
                self.inflate.total_in() != in_before || self.inflate.total_out() != out_before;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    let input_done = consumed >= self.buffer.len();
                    let output_room = output.len() < output.capacity();
                    if (input_done && output_room) || !progressed {
                        break;
                    }
                }
            }
        }

        Ok(output)
    }
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecompressor for ZlibStream {
    fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        if chunk.is_empty() {
            return Ok(None);
        }
        self.stats.bytes_read += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let result = self.inflate_buffer();
        self.buffer.clear();
        let output = result?;

        self.stats.bytes_written += output.len() as u64;
        self.stats.frames_processed += 1;
        Ok(Some(output))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.inflate.reset(true);
        self.buffer.clear();
        self.stats = CodecStats::default();
        Ok(())
    }

    fn stats(&self) -> CodecStats {
        self.stats
    }
}
