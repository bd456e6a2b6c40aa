//! Hash-sharded local filesystem store.
//!
//! Objects live at `{root}/{s1}/{s2}/{s3}/{leaf}` (see [`ShardLayout`]).
//! Directories are created lazily on write and reclaimed on delete, walking
//! upward from the removed file until a non-empty directory or the root.
//!
//! No in-process locks are taken. `rmdir` refuses non-empty directories
//! atomically, so the reclaim walk can never drop data, and writers retry
//! directory creation if a concurrent reclaim removes their freshly created
//! parent before their temporary file lands in it.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::layout::{ShardLayout, validate_id};
use crate::{Error, FileReader, FileStorage, Result};

/// State marker file name, kept at the store root.
const STATE_FILE: &str = ".state";

/// Suffix of in-flight writes. Never listed, never readable.
const TEMP_SUFFIX: &str = ".tmp";

/// Current on-disk format version.
const STATE_VERSION: u32 = 1;

/// Attempts at landing a temporary file in a shard directory that keeps
/// getting reclaimed underneath us.
const MAX_CREATE_ATTEMPTS: usize = 8;

/// Temporary files older than this are swept by `recreate_state_file`.
const STALE_TEMP_AGE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StateMarker {
    version: u32,
    layout: ShardLayout,
}

/// A hash-sharded local filesystem store.
///
/// - Identifiers are relative paths generated by the store, e.g.
///   `"3f/9a/1c/0e7b2d4e8f9a0b1c2d3e4f5a6b"`.
/// - All objects are stored under a configured root directory.
/// - Caller-supplied identifiers are validated to prevent directory traversal.
/// - Writes go to a temporary sibling and are renamed into place, so a
///   failed save never leaves a readable object behind.
#[derive(Clone)]
pub struct ShardedFileStore {
    root: PathBuf,
    layout: ShardLayout,
}

impl fmt::Debug for ShardedFileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedFileStore")
            .field("root", &self.root)
            .field("layout", &self.layout)
            .finish()
    }
}

/// Builder for [`ShardedFileStore`].
#[derive(Debug, Clone)]
pub struct ShardedFileStoreBuilder {
    root: PathBuf,
    layout: ShardLayout,
}

impl ShardedFileStoreBuilder {
    /// Set the directory fan-out scheme (default: three 2-character levels).
    pub fn layout(mut self, layout: ShardLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Create the root directory if needed and write the state marker on first
    /// use.
    ///
    /// Fails with [`Error::InvalidConfig`] if the root already holds a store
    /// with a different layout, since its identifiers would no longer resolve.
    pub async fn open(self) -> Result<ShardedFileStore> {
        self.layout.validate()?;
        tokio::fs::create_dir_all(&self.root).await?;

        let store = ShardedFileStore {
            root: self.root,
            layout: self.layout,
        };

        match store.read_marker().await? {
            None => {
                store.write_marker().await?;
                debug!(root = %store.root.display(), "initialized sharded file store");
            }
            Some(Ok(marker)) if marker.layout != store.layout => {
                return Err(Error::InvalidConfig(format!(
                    "{} holds a {}x{} store, requested {}x{}",
                    store.root.display(),
                    marker.layout.depth,
                    marker.layout.width,
                    store.layout.depth,
                    store.layout.width
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(root = %store.root.display(), error = %e, "unreadable state marker");
            }
        }

        Ok(store)
    }
}

impl ShardedFileStore {
    /// Start configuring a store rooted at `root`.
    pub fn builder(root: impl Into<PathBuf>) -> ShardedFileStoreBuilder {
        ShardedFileStoreBuilder {
            root: root.into(),
            layout: ShardLayout::default(),
        }
    }

    /// Open a store rooted at `root` with the default layout.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(root).open().await
    }

    /// Return the configured root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the directory fan-out scheme.
    pub fn layout(&self) -> ShardLayout {
        self.layout
    }

    fn path_for_id(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        let path = Path::new(id);
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name == STATE_FILE || name.ends_with(TEMP_SUFFIX) {
            return Err(Error::PermissionDenied(format!("reserved file name: {id}")));
        }
        Ok(self.root.join(path))
    }

    fn id_for_path(&self, p: &Path) -> Result<String> {
        let rel = p
            .strip_prefix(&self.root)
            .map_err(|e| Error::Generic(format!("failed to relativize path: {e}")))?;

        let s = rel
            .to_str()
            .ok_or_else(|| Error::Generic("non-utf8 path under root".into()))?
            .replace('\\', "/");

        Ok(s)
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    fn expected_marker(&self) -> StateMarker {
        StateMarker {
            version: STATE_VERSION,
            layout: self.layout,
        }
    }

    /// `None` if absent, `Some(Err)` if present but unparsable.
    async fn read_marker(&self) -> Result<Option<serde_json::Result<StateMarker>>> {
        match tokio::fs::read(self.marker_path()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish the marker through a temporary file private to this call.
    async fn write_marker(&self) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&self.expected_marker())
            .map_err(|e| Error::Generic(format!("failed to encode state marker: {e}")))?;

        let path = self.marker_path();
        let tmp_path = self.root.join(format!(
            "{STATE_FILE}.{}{TEMP_SUFFIX}",
            Uuid::new_v4().simple()
        ));

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)
                .await?;
            file.write_all(&payload).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(e) = result {
            if let Err(rm) = tokio::fs::remove_file(&tmp_path).await
                && rm.kind() != ErrorKind::NotFound
            {
                warn!(path = %tmp_path.display(), error = %rm, "failed to remove partial state marker");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Open a leaf for reading, mapping absence (or a directory) to `NotFound`.
    async fn open_leaf(&self, id: &str) -> Result<(tokio::fs::File, u64)> {
        let path = self.path_for_id(id)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let md = file.metadata().await?;
        if !md.is_file() {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok((file, md.len()))
    }

    /// Open an existing leaf for writing without creating it.
    async fn open_leaf_for_write(&self, id: &str) -> Result<tokio::fs::File> {
        let path = self.path_for_id(id)?;
        let file = match tokio::fs::OpenOptions::new().write(true).open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(id.to_string()));
            }
            Err(e) if e.kind() == ErrorKind::IsADirectory => {
                return Err(Error::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !file.metadata().await?.is_file() {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(file)
    }

    /// Create `tmp_path` exclusively, creating its parent directories first.
    ///
    /// A concurrent delete may reclaim a parent between `create_dir_all` and
    /// the open; that surfaces as `NotFound` and is retried.
    async fn create_temp_file(&self, tmp_path: &Path) -> Result<tokio::fs::File> {
        let parent = tmp_path
            .parent()
            .ok_or_else(|| Error::Generic(format!("no parent for {}", tmp_path.display())))?;

        let mut attempt = 1;
        loop {
            let result = match tokio::fs::create_dir_all(parent).await {
                Ok(()) => {
                    tokio::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(tmp_path)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == ErrorKind::NotFound && attempt < MAX_CREATE_ATTEMPTS => {
                    trace!(path = %parent.display(), attempt, "shard directory reclaimed concurrently, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stream `input` into `tmp_path`, then rename it onto `path`.
    async fn write_object<R: AsyncRead + Send + Unpin>(
        &self,
        input: &mut R,
        tmp_path: &Path,
        path: &Path,
    ) -> Result<u64> {
        let mut file = self.create_temp_file(tmp_path).await?;
        let written = tokio::io::copy(input, &mut file).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(tmp_path, path).await?;
        Ok(written)
    }

    /// Remove empty directories from `start` upward, stopping at the first
    /// directory that still holds something, or at the root.
    ///
    /// Losing a race is fine: a directory that is already gone is skipped, and
    /// one that a writer has just populated refuses removal and ends the walk.
    async fn prune_empty_dirs(&self, start: Option<&Path>) {
        let mut current = start;
        while let Some(dir) = current {
            if dir == self.root.as_path() || !dir.starts_with(&self.root) {
                break;
            }
            match tokio::fs::remove_dir(dir).await {
                Ok(()) => trace!(path = %dir.display(), "removed empty shard directory"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    trace!(path = %dir.display(), error = %e, "shard directory kept");
                    break;
                }
            }
            current = dir.parent();
        }
    }

    /// Walk the subtree, returning every stored leaf and every directory
    /// (deepest first).
    async fn walk(&self) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut rd = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                // Reclaimed by a concurrent delete, or the store was removed.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                let ty = match entry.file_type().await {
                    Ok(ty) => ty,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if ty.is_dir() {
                    dirs.push(path.clone());
                    stack.push(path);
                } else if ty.is_file() {
                    files.push(path);
                }
            }
        }

        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        Ok((files, dirs))
    }

    fn is_internal(&self, path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        name.ends_with(TEMP_SUFFIX) || path == self.marker_path().as_path()
    }

    /// Sweep temporary files abandoned by crashed writers and the empty
    /// directories around them.
    async fn sweep_stale(&self) -> Result<()> {
        let (files, dirs) = self.walk().await?;
        let now = SystemTime::now();

        for path in files.iter().filter(|p| self.is_internal(p)) {
            if *path == self.marker_path() {
                continue;
            }
            let stale = match tokio::fs::metadata(path).await.and_then(|md| md.modified()) {
                Ok(modified) => now
                    .duration_since(modified)
                    .map(|age| age >= STALE_TEMP_AGE)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if stale {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(path = %path.display(), "removed stale temporary file"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for dir in &dirs {
            if tokio::fs::remove_dir(dir).await.is_ok() {
                trace!(path = %dir.display(), "removed empty shard directory");
            }
        }
        Ok(())
    }
}

/// `path` with [`TEMP_SUFFIX`] appended to its file name.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

impl FileStorage for ShardedFileStore {
    fn uri(&self) -> String {
        let abs = std::path::absolute(&self.root).unwrap_or_else(|_| self.root.clone());
        let mut uri = String::from("file://");
        for c in abs.components() {
            if let Component::Normal(part) = c {
                uri.push('/');
                uri.push_str(&urlencoding::encode(&part.to_string_lossy()));
            }
        }
        uri.push('/');
        uri
    }

    async fn save_new_file<R: AsyncRead + Send + Unpin>(&self, mut input: R) -> Result<String> {
        let id = self.layout.new_identifier();
        let path = self.root.join(&id);
        let tmp_path = temp_path_for(&path);

        match self.write_object(&mut input, &tmp_path, &path).await {
            Ok(size) => {
                debug!(%id, size, "stored file");
                Ok(id)
            }
            Err(e) => {
                match tokio::fs::remove_file(&tmp_path).await {
                    Ok(()) => {}
                    Err(rm) if rm.kind() == ErrorKind::NotFound => {}
                    Err(rm) => {
                        warn!(path = %tmp_path.display(), error = %rm, "failed to remove partial write");
                    }
                }
                self.prune_empty_dirs(path.parent()).await;
                Err(e)
            }
        }
    }

    async fn get_file(&self, id: &str) -> Result<FileReader> {
        let (file, _) = self.open_leaf(id).await?;
        Ok(Box::new(file))
    }

    async fn get_file_range(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FileReader> {
        let (mut file, size) = self.open_leaf(id).await?;
        let end = match length {
            Some(len) => offset.checked_add(len),
            None => Some(size),
        };
        let len = match end {
            Some(end) if offset <= size && end <= size => end - offset,
            _ => {
                return Err(Error::InvalidRange {
                    id: id.to_string(),
                    offset,
                    length,
                    size,
                });
            }
        };

        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(len)))
    }

    async fn append_to_file<R: AsyncRead + Send + Unpin>(
        &self,
        mut input: R,
        id: &str,
        offset: u64,
    ) -> Result<u64> {
        let mut file = self.open_leaf_for_write(id).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let written = tokio::io::copy(&mut input, &mut file).await?;
        file.flush().await?;

        let len = file.metadata().await?.len();
        debug!(%id, offset, written, len, "appended to file");
        Ok(len)
    }

    async fn set_file_length(&self, length: u64, id: &str) -> Result<()> {
        let file = self.open_leaf_for_write(id).await?;
        file.set_len(length).await?;
        debug!(%id, length, "set file length");
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let path = self.path_for_id(id)?;
        match tokio::fs::metadata(path).await {
            Ok(md) => Ok(md.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, id: &str) -> Result<bool> {
        let path = self.path_for_id(id)?;
        match tokio::fs::symlink_metadata(&path).await {
            Ok(md) if md.is_dir() => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        debug!(%id, "deleted file");
        self.prune_empty_dirs(path.parent()).await;
        Ok(true)
    }

    async fn delete_files(&self, ids: &[String]) -> Result<BTreeSet<String>> {
        let mut not_deleted = BTreeSet::new();
        for id in ids {
            match self.delete_file(id).await {
                Ok(true) => {}
                Ok(false) => {
                    not_deleted.insert(id.clone());
                }
                Err(e) => {
                    warn!(%id, error = %e, "failed to delete file");
                    not_deleted.insert(id.clone());
                }
            }
        }
        Ok(not_deleted)
    }

    async fn get_file_size(&self, id: &str) -> Result<u64> {
        let path = self.path_for_id(id)?;
        match tokio::fs::metadata(path).await {
            Ok(md) if md.is_file() => Ok(md.len()),
            Ok(_) => Err(Error::NotFound(id.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_file_list(&self) -> Result<BTreeSet<String>> {
        let (files, _) = self.walk().await?;
        files
            .iter()
            .filter(|p| !self.is_internal(p))
            .map(|p| self.id_for_path(p))
            .collect()
    }

    async fn state_file_is_correct(&self) -> Result<bool> {
        Ok(match self.read_marker().await? {
            Some(Ok(marker)) => marker == self.expected_marker(),
            Some(Err(_)) | None => false,
        })
    }

    async fn recreate_state_file(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        self.sweep_stale().await?;
        self.write_marker().await?;
        debug!(root = %self.root.display(), "recreated state marker");
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(root = %self.root.display(), "removed sharded file store");
        Ok(())
    }
}
