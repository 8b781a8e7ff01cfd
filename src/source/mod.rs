// Storage collaborators: log, drive and mirror contracts plus in-memory backends.

pub mod memory;
pub mod mirror;
pub mod traits;
