pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod plan;
pub mod source;

pub use engine::prefetcher::{PrefetchEvent, PrefetchRun, Prefetcher, RunState};
pub use engine::stats::Stats;
pub use error::PrefetchError;
