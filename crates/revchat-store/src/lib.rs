//! Durable credential state.
//!
//! One JSON state file per back-end. The store is deliberately safe to lose:
//! a missing or corrupt file loads as "no prior state" and the pool rebuilds
//! validity through lazy revalidation.

pub mod file;

pub use file::{FileArtifactStore, StoreError};
