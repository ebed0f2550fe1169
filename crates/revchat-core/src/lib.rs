pub mod core;
pub mod error;
pub mod handler;
pub mod stream;

pub use core::{Core, CoreState, ProviderLookup};
