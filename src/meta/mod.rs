//! Client metadata core: routing cache, retrying task executor, and the
//! typed operation surface the filesystem layer consumes.

pub mod cache;
pub mod client;
pub mod executor;
pub mod types;
