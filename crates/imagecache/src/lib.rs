//! Content-addressed image cache on the local filesystem.
//!
//! Every cache entry is a pair of sibling files: the image bytes exactly
//! as served by the object store, and a `.sha256` sidecar holding the hex
//! digest. The sidecar is the commit marker: it is written only after the
//! image is fsync-durable, so a present sidecar implies a complete image.

pub mod cache;
pub mod error;

pub use cache::{CacheEntry, ImageCache};
pub use error::{CacheError, CacheResult};
