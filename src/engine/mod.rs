pub mod buffer;
pub mod cipher;
pub mod cipher_cache;
pub mod codec;
pub mod database;
pub mod events;
pub mod filter;
pub mod map;
pub mod persistence;

pub use buffer::{BufferPool, PooledBuffer};
pub use cipher::CipherProvider;
pub use cipher_cache::CipherCache;
pub use database::Database;
pub use events::{ChangeEvent, ChangeType};
pub use filter::{CustomFilter, TypeFilter};
pub use map::{Entry, KeyComparer, StoreMap};
pub use persistence::Serializer;
