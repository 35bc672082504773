//! Building footprint acquisition.
//!
//! Seed points become Overpass query links, links are split into one shard
//! per worker slot, and each worker fetches its shard through its own Tor
//! identity, rebuilds polygons and appends them to a shared CSV table that
//! doubles as the resume checkpoint.

pub mod element;
pub mod error;
pub mod fetch;
pub mod geometry;
pub mod headers;
pub mod identity;
pub mod link;
pub mod metrics;
pub mod partition;
pub mod progress;
pub mod record;
pub mod seed;
pub mod store;
pub mod tor;
pub mod worker;

pub use error::{CollectError, CollectResult};
