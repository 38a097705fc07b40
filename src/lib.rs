pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extractor;
pub mod handler;
pub mod hash;
pub mod key;
pub mod layer;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod record;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use cache::LocalCache;
pub use config::IdempotencyConfig;
pub use coordinator::IdempotencyCoordinator;
pub use error::{HandlerError, IdempotencyError};
pub use extractor::{JsonPathExtractor, KeyExtractor};
pub use handler::{with_idempotency, IdempotencyHandler, IdempotentFuture};
pub use hash::generate_hash;
pub use key::KeyBuilder;
pub use layer::{
    idempotency_middleware, IdempotencyState, RecordedResponse, IDEMPOTENCY_KEY_HEADER,
    REPLAYED_HEADER,
};
pub use memory::InMemoryPersistenceStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresPersistenceStore;
pub use record::{DataRecord, DataRecordStatus};
#[cfg(feature = "redis")]
pub use self::redis::RedisPersistenceStore;
pub use store::{PersistenceStore, RecordAttributes};

#[cfg(feature = "mock")]
pub use store::MockPersistenceStore;
