//! Shared utilities.
//!
//! Git hash checks, filesystem helpers, deterministic tar files and retry
//! with backoff.

pub mod commit;
pub mod fs;
pub mod retry;
pub mod tar;

#[cfg(test)]
pub mod testutil;
