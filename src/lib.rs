use std::collections::BTreeSet;
use std::fmt::Debug;

use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;

#[cfg(feature = "memory")]
pub use adapters::memory::MemoryFileStore;
#[cfg(feature = "local")]
pub use adapters::sharded::{ShardedFileStore, ShardedFileStoreBuilder};

pub use adapters::multi;
pub use adapters::multi::{CompositeFileStore, CompositeFileStoreBuilder};
pub use layout::ShardLayout;

pub mod layout;
pub mod mime;

/// A specialized Result type for file storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Readable byte stream handed out by [`FileStorage::get_file`].
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// A unified Error type for file storage operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid range for {id}: offset {offset}, length {length:?}, file size {size}")]
    InvalidRange {
        id: String,
        offset: u64,
        length: Option<u64>,
        size: u64,
    },

    #[error("Unknown file storage prefix: {0}")]
    UnknownPrefix(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("IO Error")]
    Io(#[from] std::io::Error),

    #[error("Generic storage error: {0}")]
    Generic(String),
}

/// Adapter modules, gated behind Cargo features.
pub mod adapters {
    #[cfg(feature = "memory")]
    pub mod memory;
    pub mod multi;
    #[cfg(feature = "local")]
    pub mod sharded;
}

/// The file storage capability.
///
/// Identifiers are opaque strings produced by [`save_new_file`](Self::save_new_file).
/// Leaf stores hand out `"<s1>/<s2>/<s3>/<leaf>"` identifiers; a
/// [`CompositeFileStore`] may put a registered prefix in front of them.
///
/// Uses Tokio's [`AsyncRead`] for both directions. The trait is not
/// dyn-compatible (it returns `impl Future`), so composites are generic over a
/// single backend type.
pub trait FileStorage: Send + Sync + Debug {
    /// URI identifying this store.
    fn uri(&self) -> String;

    /// Store the whole input under a freshly generated identifier.
    fn save_new_file<R: AsyncRead + Send + Unpin>(
        &self,
        input: R,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Open a stored file for reading.
    fn get_file(&self, id: &str) -> impl std::future::Future<Output = Result<FileReader>> + Send;

    /// Open `length` bytes of a stored file starting at `offset`.
    ///
    /// `None` reads to the end of the file. A range that starts or ends past
    /// the end of the file fails with [`Error::InvalidRange`].
    fn get_file_range(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> impl std::future::Future<Output = Result<FileReader>> + Send;

    /// Write `input` into an existing file starting at `offset`. Returns the
    /// resulting file length.
    fn append_to_file<R: AsyncRead + Send + Unpin>(
        &self,
        input: R,
        id: &str,
        offset: u64,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Truncate or extend an existing file to exactly `length` bytes.
    fn set_file_length(
        &self,
        length: u64,
        id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Check if a file exists.
    fn exists(&self, id: &str) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Delete a file. Returns `false` if it did not exist.
    fn delete_file(&self, id: &str) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Delete several files, returning the identifiers that were not deleted.
    fn delete_files(
        &self,
        ids: &[String],
    ) -> impl std::future::Future<Output = Result<BTreeSet<String>>> + Send;

    /// Size of a stored file in bytes.
    fn get_file_size(&self, id: &str) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// MIME type derived from the name's extension.
    fn get_mime_type(&self, name: &str) -> String {
        mime::mime_type_for(name).to_string()
    }

    /// Every stored identifier, sorted.
    fn get_file_list(&self) -> impl std::future::Future<Output = Result<BTreeSet<String>>> + Send;

    /// Whether the persisted state marker matches the store's layout.
    fn state_file_is_correct(&self) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Regenerate the state marker.
    fn recreate_state_file(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Tear down the whole store.
    fn remove(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Convenience methods built on [`FileStorage`].
pub trait FileStorageExt: FileStorage {
    /// Store a byte slice under a new identifier.
    fn save_bytes(&self, bytes: &[u8]) -> impl std::future::Future<Output = Result<String>> + Send {
        async move { self.save_new_file(std::io::Cursor::new(bytes)).await }
    }

    /// Read a whole file into memory.
    fn get_bytes(&self, id: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send {
        async move {
            let mut reader = self.get_file(id).await?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            Ok(buf)
        }
    }

    /// Read a byte range into memory.
    fn get_range_bytes(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send {
        async move {
            let mut reader = self.get_file_range(id, offset, length).await?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            Ok(buf)
        }
    }

    /// Read a file as a UTF-8 string.
    fn get_string(&self, id: &str) -> impl std::future::Future<Output = Result<String>> + Send {
        async move {
            let bytes = self.get_bytes(id).await?;
            String::from_utf8(bytes).map_err(|e| Error::Generic(format!("invalid utf-8: {e}")))
        }
    }

    /// Read a file as a stream of byte chunks.
    fn get_stream(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<BoxStream<'static, Result<Bytes>>>> + Send {
        async move {
            let reader = self.get_file(id).await?;
            Ok(ReaderStream::new(reader)
                .map(|chunk| chunk.map_err(Error::from))
                .boxed())
        }
    }

    /// Copy a file into another storage, returning its identifier there.
    ///
    /// # Example
    ///
    /// ```rust
    /// # #[cfg(feature = "memory")]
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// use shardstow::{FileStorage, FileStorageExt, MemoryFileStore};
    ///
    /// let source = MemoryFileStore::new();
    /// let dest = MemoryFileStore::new();
    ///
    /// let id = source.save_bytes(b"hello").await?;
    /// let copied = source.copy_to(&id, &dest).await?;
    ///
    /// assert_eq!(dest.get_bytes(&copied).await?, b"hello");
    /// assert!(source.exists(&id).await?);
    /// # Ok(())
    /// # }
    /// ```
    fn copy_to<S2: FileStorage>(
        &self,
        id: &str,
        dest: &S2,
    ) -> impl std::future::Future<Output = Result<String>> + Send {
        async move {
            let reader = self.get_file(id).await?;
            dest.save_new_file(reader).await
        }
    }
}

impl<T: FileStorage + ?Sized> FileStorageExt for T {}
