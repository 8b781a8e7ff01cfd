// Warmup plan model: per-log block spans that make a drive usable quickly.

mod codec;

use bytes::Bytes;
use thiserror::Error;

pub use codec::{decode_spans, encode_spans};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanDecodeError {
    #[error("no warmup entry stored in drive metadata")]
    MissingPlan,
    #[error("plan truncated")]
    Truncated,
    #[error("varint exceeds 64 bits")]
    VarintOverflow,
    #[error("span {index} has zero width")]
    ZeroWidth { index: usize },
    #[error("span {index} overflows the block index space")]
    IndexOverflow { index: usize },
    #[error("{0} trailing bytes after span list")]
    TrailingBytes(usize),
}

/// Half-open block range `[start, end)` within one log. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    start: u64,
    end: u64,
}

impl Span {
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    /// A span covering exactly one block.
    pub fn block(index: u64) -> Option<Self> {
        Self::new(index, index.checked_add(1)?)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn width(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_single(&self) -> bool {
        self.width() == 1
    }
}

/// Encoded plan as stored in the drive: one buffer per log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupPayload {
    pub meta: Bytes,
    pub data: Bytes,
}

/// Decoded plan. `metadata` targets the metadata log, `blobs` the blob log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupPlan {
    pub metadata: Vec<Span>,
    pub blobs: Vec<Span>,
}

impl WarmupPlan {
    pub fn decode(payload: &WarmupPayload) -> Result<Self, PlanDecodeError> {
        Ok(Self {
            metadata: decode_spans(&payload.meta)?,
            blobs: decode_spans(&payload.data)?,
        })
    }

    pub fn encode(&self) -> WarmupPayload {
        WarmupPayload {
            meta: encode_spans(&self.metadata),
            data: encode_spans(&self.blobs),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.blobs.is_empty()
    }
}
