//! Multi-storage adapters for combining multiple file storage backends.
//!
//! [`CompositeFileStore`] implements the `FileStorage` trait by routing each
//! identifier to one of several backends through a prefix table.
//!
//! # Examples
//!
//! ## Prefix routing over sharded stores
//!
//! ```no_run
//! # use shardstow::{FileStorage, FileStorageExt};
//! # async fn example() -> shardstow::Result<()> {
//! use shardstow::multi::CompositeFileStore;
//! # use shardstow::ShardedFileStore;
//!
//! let legacy = ShardedFileStore::open("/var/filestore/legacy").await?;
//! let hashed = ShardedFileStore::open("/var/filestore/hashed").await?;
//!
//! let storage: CompositeFileStore<ShardedFileStore> = CompositeFileStore::builder(legacy)
//!     .backend("hash", hashed)
//!     .own_prefix("hash")
//!     .build()?;
//!
//! // New files land in the "hash" backend, old identifiers keep resolving.
//! let id = storage.save_bytes(b"attachment").await?;
//! assert!(id.starts_with("hash/"));
//! # Ok(())
//! # }
//! ```

mod composite;

pub use composite::{CompositeFileStore, CompositeFileStoreBuilder};
