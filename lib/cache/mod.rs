/// Eviction hooks fired when a keyed entry is removed.
pub mod eviction;
/// Key-addressed cache with per-key single-flight generation and TTL expiry.
pub mod keyed;
/// Single-slot TTL cache.
pub mod single;

pub use eviction::{CloseOnEvict, EvictionHook, NoEviction, Release};
pub use keyed::KeyedCache;
pub use single::SingleValueCache;
