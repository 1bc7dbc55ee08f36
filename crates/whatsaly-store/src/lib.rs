//! Durable session state and external cache access.

pub mod cache;
pub mod error;
pub mod file;
pub mod record;
pub mod redis_cache;
pub mod sqlite;
pub mod store;

pub use cache::{CacheKeys, InMemoryCache, SessionCache};
pub use error::{CacheError, CacheResult, StoreError, StoreResult};
pub use file::FileSessionStore;
pub use record::{SessionRecord, SessionTable};
pub use redis_cache::RedisCache;
pub use sqlite::SqliteSessionStore;
pub use store::SessionStore;
