mod backend;
mod fingerprint;
mod store;

pub use backend::{CacheRecord, JsonFileBackend, MemoryBackend, StorageBackend};
pub use fingerprint::fingerprint;
pub use store::{approx_payload_bytes, AssetCache, CacheLimits, CacheStats};
