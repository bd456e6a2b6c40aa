use crate::layout::ShardLayout;
use crate::{Error, FileReader, FileStorage, Result};
use std::collections::{BTreeSet, HashMap, TryReserveError};
use std::io::ErrorKind;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};

static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(0);

/// A simple in-memory `FileStorage` adapter.
///
/// - Identifiers have the same sharded shape as [`ShardedFileStore`](crate::ShardedFileStore).
/// - Data is stored as raw bytes in a `HashMap`.
/// - The state marker is an in-memory flag.
/// - Intended for tests, local development, and ephemeral usage.
#[derive(Clone)]
pub struct MemoryFileStore {
    inner: Arc<RwLock<Inner>>,
    layout: ShardLayout,
    instance: usize,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, Vec<u8>>,
    state_ok: bool,
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::with_layout(ShardLayout::default())
    }
}

impl MemoryFileStore {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty in-memory storage handing out identifiers in `layout`.
    pub fn with_layout(layout: ShardLayout) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                files: HashMap::new(),
                state_ok: true,
            })),
            layout,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Create a storage pre-populated with `files`.
    ///
    /// Keys are used as identifiers verbatim.
    pub fn from_map(files: HashMap<String, Vec<u8>>) -> Self {
        let store = Self::new();
        store.inner.write().expect("poisoned lock").files = files;
        store
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.read().expect("poisoned lock").files.len()
    }

    /// Returns true if there are no stored objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the state flag as broken (useful for tests).
    pub fn invalidate_state(&self) {
        self.inner.write().expect("poisoned lock").state_ok = false;
    }

    fn read_file(&self, id: &str) -> Result<Vec<u8>> {
        let inner = self.inner.read().expect("poisoned lock");
        inner
            .files
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

fn too_large(id: &str, size: u64) -> Error {
    Error::Io(std::io::Error::new(
        ErrorKind::FileTooLarge,
        format!("{id}: size {size} exceeds in-memory capacity"),
    ))
}

/// Zero-extend `data` to `len`, failing instead of aborting when the
/// allocation cannot be made.
fn grow(data: &mut Vec<u8>, len: usize) -> std::result::Result<(), TryReserveError> {
    data.try_reserve_exact(len - data.len())?;
    data.resize(len, 0);
    Ok(())
}

impl fmt::Debug for MemoryFileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Avoid dumping potentially large in-memory contents.
        f.debug_struct("MemoryFileStore")
            .field("instance", &self.instance)
            .field("len", &self.len())
            .finish()
    }
}

impl FileStorage for MemoryFileStore {
    fn uri(&self) -> String {
        format!("memory://{}", self.instance)
    }

    async fn save_new_file<R: AsyncRead + Send + Unpin>(&self, mut input: R) -> Result<String> {
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).await?;

        let mut inner = self.inner.write().expect("poisoned lock");
        let mut id = self.layout.new_identifier();
        while inner.files.contains_key(&id) {
            id = self.layout.new_identifier();
        }
        inner.files.insert(id.clone(), buf);
        Ok(id)
    }

    async fn get_file(&self, id: &str) -> Result<FileReader> {
        let bytes = self.read_file(id)?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn get_file_range(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FileReader> {
        let bytes = self.read_file(id)?;
        let size = bytes.len() as u64;
        let end = match length {
            Some(len) => offset.checked_add(len),
            None => Some(size),
        };
        match end {
            Some(end) if offset <= size && end <= size => Ok(Box::new(std::io::Cursor::new(
                bytes[offset as usize..end as usize].to_vec(),
            ))),
            _ => Err(Error::InvalidRange {
                id: id.to_string(),
                offset,
                length,
                size,
            }),
        }
    }

    async fn append_to_file<R: AsyncRead + Send + Unpin>(
        &self,
        mut input: R,
        id: &str,
        offset: u64,
    ) -> Result<u64> {
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).await?;

        let mut inner = self.inner.write().expect("poisoned lock");
        let data = inner
            .files
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let end = usize::try_from(offset)
            .ok()
            .and_then(|start| start.checked_add(buf.len()))
            .ok_or_else(|| too_large(id, offset))?;
        let start = end - buf.len();
        if data.len() < end {
            grow(data, end).map_err(|_| too_large(id, offset))?;
        }
        data[start..end].copy_from_slice(&buf);
        Ok(data.len() as u64)
    }

    async fn set_file_length(&self, length: u64, id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("poisoned lock");
        let data = inner
            .files
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let len = usize::try_from(length).map_err(|_| too_large(id, length))?;
        if len > data.len() {
            grow(data, len).map_err(|_| too_large(id, length))?;
        } else {
            data.truncate(len);
        }
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let inner = self.inner.read().expect("poisoned lock");
        Ok(inner.files.contains_key(id))
    }

    async fn delete_file(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().expect("poisoned lock");
        Ok(inner.files.remove(id).is_some())
    }

    async fn delete_files(&self, ids: &[String]) -> Result<BTreeSet<String>> {
        let mut inner = self.inner.write().expect("poisoned lock");
        Ok(ids
            .iter()
            .filter(|id| inner.files.remove(id.as_str()).is_none())
            .cloned()
            .collect())
    }

    async fn get_file_size(&self, id: &str) -> Result<u64> {
        let inner = self.inner.read().expect("poisoned lock");
        inner
            .files
            .get(id)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn get_file_list(&self) -> Result<BTreeSet<String>> {
        let inner = self.inner.read().expect("poisoned lock");
        Ok(inner.files.keys().cloned().collect())
    }

    async fn state_file_is_correct(&self) -> Result<bool> {
        Ok(self.inner.read().expect("poisoned lock").state_ok)
    }

    async fn recreate_state_file(&self) -> Result<()> {
        self.inner.write().expect("poisoned lock").state_ok = true;
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let mut inner = self.inner.write().expect("poisoned lock");
        inner.files.clear();
        inner.state_ok = false;
        Ok(())
    }
}
