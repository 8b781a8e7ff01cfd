// Terminal failures of a prefetch run.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::plan::PlanDecodeError;

/// Which log of the drive a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Metadata,
    Blobs,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => f.write_str("metadata"),
            Self::Blobs => f.write_str("blobs"),
        }
    }
}

/// Shared so the error stays cheap to clone; the chain stays walkable.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A run either finishes or rejects with exactly one of these.
///
/// Cloneable so every holder of a run handle observes the same outcome.
#[derive(Debug, Clone, Error)]
pub enum PrefetchError {
    #[error("invalid warmup plan: {0}")]
    PlanDecode(#[from] PlanDecodeError),

    #[error("{log} download failed: {cause}")]
    Download {
        log: LogKind,
        #[source]
        cause: Cause,
    },

    #[error("mirror failed: {0}")]
    Mirror(#[source] Cause),

    #[error("prefetch cancelled")]
    Cancelled,

    #[error("prefetch task ended without an outcome")]
    Aborted,
}

impl PrefetchError {
    pub(crate) fn download(log: LogKind, cause: anyhow::Error) -> Self {
        Self::Download {
            log,
            cause: Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(cause)),
        }
    }

    pub(crate) fn mirror(cause: anyhow::Error) -> Self {
        Self::Mirror(Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(cause)))
    }
}
