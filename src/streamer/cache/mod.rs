pub mod cache_traits;
pub mod lru;

pub use cache_traits::{CoreCache, LRUCacheTrait, MutableCache};
pub use lru::LRUCache;
