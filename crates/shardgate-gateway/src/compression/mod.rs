//! Streaming decompression of gateway frames
//!
//! One decompressor lives for exactly one connection: its dictionary state
//! spans every frame of that connection and is discarded on teardown.

mod zlib;
mod zstd_stream;

pub use self::zlib::{ZlibStream, ZLIB_SUFFIX};
pub use self::zstd_stream::ZstdStream;

use shardgate_common::CompressionMode;

/// Chunk size for decompression output buffers
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Counters kept by every decompressor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Compressed bytes fed in
    pub bytes_read: u64,
    /// Decompressed bytes produced
    pub bytes_written: u64,
    /// Complete messages (zlib) or frames (zstd) produced
    pub frames_processed: u64,
}

/// Decompression failure; fatal to the owning connection only
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to initialize decompressor: {0}")]
    Init(String),

    #[error("Inflate failed: {0}")]
    Inflate(String),

    #[error("Zstd decode failed: {0}")]
    Zstd(String),
}

/// Incremental decompressor for one connection
pub trait StreamDecompressor: Send {
    /// Feed one transport frame.
    ///
    /// Returns `Some(message)` once a complete message is available,
    /// `None` while more input is needed.
    fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError>;

    /// Drop buffered input, dictionary state and counters
    fn reset(&mut self) -> Result<(), CodecError>;

    fn stats(&self) -> CodecStats;
}

/// Frames pass through untouched
#[derive(Debug, Default)]
pub struct Passthrough {
    stats: CodecStats,
}

impl StreamDecompressor for Passthrough {
    fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        let len = chunk.len() as u64;
        self.stats.bytes_read += len;
        self.stats.bytes_written += len;
        self.stats.frames_processed += 1;
        Ok(Some(chunk.to_vec()))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.stats = CodecStats::default();
        Ok(())
    }

    fn stats(&self) -> CodecStats {
        self.stats
    }
}

/// Decompressor selected by the negotiated compression mode
pub enum Decompressor {
    Passthrough(Passthrough),
    Zlib(ZlibStream),
    Zstd(ZstdStream),
}

impl Decompressor {
    /// Fresh decompressor for a new connection
    pub fn new(mode: CompressionMode) -> Result<Self, CodecError> {
        Ok(match mode {
            CompressionMode::None => Self::Passthrough(Passthrough::default()),
            CompressionMode::ZlibStream => Self::Zlib(ZlibStream::new()),
            CompressionMode::ZstdStream => Self::Zstd(ZstdStream::new()?),
        })
    }

    fn inner(&mut self) -> &mut dyn StreamDecompressor {
        match self {
            Self::Passthrough(codec) => codec,
            Self::Zlib(codec) => codec,
            Self::Zstd(codec) => codec,
        }
    }
}

impl StreamDecompressor for Decompressor {
    fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        self.inner().push(chunk)
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.inner().reset()
    }

    fn stats(&self) -> CodecStats {
        match self {
            Self::Passthrough(codec) => codec.stats(),
            Self::Zlib(codec) => codec.stats(),
            Self::Zstd(codec) => codec.stats(),
        }
    }
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Passthrough(_) => "passthrough",
            Self::Zlib(_) => "zlib-stream",
            Self::Zstd(_) => "zstd-stream",
        };
        f.debug_struct("Decompressor")
            .field("kind", &kind)
            .field("stats", &self.stats())
            .finish()
    }
}
