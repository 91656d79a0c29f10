//! Quiver Store is an embedded, single-file key-value store.
//!
//! It keeps a string-keyed map of opaque byte payloads in memory and persists the
//! whole map to one file as a compact binary dictionary, optionally encrypted at rest
//! with AES-256-CBC. Keys compare either ordinally or case-insensitively, and a store
//! without a path lives purely in memory.
//!
//! ## Core Components
//! - [`engine::Database`]: the concurrent map, pending-write queue and CRUD surface.
//! - [`engine::Serializer`]: whole-file persistence, chosen once from the configuration.
//! - [`engine::CipherProvider`] / [`engine::CipherCache`]: whole-file and per-value encryption.
//! - [`engine::TypeFilter`] / [`engine::CustomFilter`]: typed logical tables sharing one file.
//! - [`engine::buffer`]: pooled buffers used on every I/O and cipher path.
//!
//! ```no_run
//! use quiver_store::{engine::Database, DatabaseConfig};
//!
//! fn main() -> quiver_store::Result<()> {
//!     let config = DatabaseConfig::file("store.db").with_encryption_key("secret");
//!     let db = Database::create_or_load(config)?;
//!     db.upsert("greeting", b"hello", None)?;
//!     db.serialize()?;
//!     assert_eq!(db.try_get("greeting", None).as_deref(), Some(&b"hello"[..]));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;

pub use config::{DatabaseConfig, StringEncoding};

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::codec::FormatError;

/// Errors returned by Quiver Store.
#[derive(Error, Debug)]
pub enum Error {
    /// The persisted file could not be turned back into a map.
    #[error("failed to deserialize database at {}: {source}", path.display())]
    Deserialization {
        path: PathBuf,
        #[source]
        source: FormatError,
    },
    /// A plaintext could not be encrypted.
    #[error("encryption failed: {0}")]
    Encryption(String),
    /// A ciphertext could not be decrypted (wrong key, corrupt data or bad padding).
    #[error("decryption failed: {0}")]
    Decryption(String),
    /// A buffer cursor was moved past the end of its storage.
    #[error("out of range: requested {requested} elements but only {available} are available")]
    OutOfRange { requested: usize, available: usize },
    /// A caller passed an argument the store cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An atomic update transform declined to produce a value.
    #[error("update aborted: {0}")]
    Aborted(String),
    /// An asynchronous operation was cancelled before it finished.
    #[error("operation cancelled")]
    Cancelled,
    /// A cipher provider was used after it was released.
    #[error("cipher provider has been released")]
    Released,
    /// A write was attempted on a closed database.
    #[error("database is closed")]
    Closed,
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O error occurred while reading or writing the database file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A typed value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// A configuration file could not be parsed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Quiver Store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A caller-supplied byte codec for values stored through a [`engine::CustomFilter`].
///
/// This is the alternative to the serde/bincode path used by the typed methods on
/// [`engine::Database`]: a type that wants full control over its byte layout implements
/// the four conversions itself.
pub trait ValueSerializer: Sized {
    /// Encodes a single value.
    fn serialize(value: &Self) -> Result<Vec<u8>>;
    /// Decodes a single value.
    fn deserialize(bytes: &[u8]) -> Result<Self>;
    /// Encodes a sequence of values stored under one key.
    fn serialize_many(values: &[Self]) -> Result<Vec<u8>>;
    /// Decodes a sequence of values stored under one key.
    fn deserialize_many(bytes: &[u8]) -> Result<Vec<Self>>;
}
