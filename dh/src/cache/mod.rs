//! Container status cache

mod core;
mod entry;

pub use core::{StatusCache, TickSummary};
pub use entry::{CacheEntry, StatusStore};
