// Host-facing helpers.

pub mod simple;
