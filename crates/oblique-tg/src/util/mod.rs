//! Assorted utility functions (missing batteries).

pub(crate) type DynError = dyn std::error::Error + Send + Sync;
