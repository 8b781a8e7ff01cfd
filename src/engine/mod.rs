// Prefetch engine: range preparation, progress estimation, transfer accounting and orchestration.

pub mod logs;
pub mod prefetcher;
pub mod progress;
pub mod ranges;
pub mod speed;
pub mod stats;
