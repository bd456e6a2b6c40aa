use crate::layout::is_shard_segment;
use crate::{Error, FileReader, FileStorage, Result};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

/// Routes identifiers to one of several backends by their leading path segment.
///
/// An identifier `"<prefix>/<rest>"` whose `<prefix>` is registered goes to
/// that backend as `"<rest>"`; everything else goes to the standard backend
/// unchanged. Identifiers coming back from a prefixed backend get the prefix
/// put back in front.
///
/// New files are written to the backend named by the own prefix, or to the
/// standard backend if none is set. Listing, removal and state checks visit
/// every backend.
///
/// Prefixes may not look like shard directory names (lowercase hex), so an
/// identifier is never ambiguous. A leading segment that is neither a
/// registered prefix nor shard-shaped is rejected with
/// [`Error::UnknownPrefix`] instead of silently hitting the standard backend.
///
/// ```
/// # use shardstow::{CompositeFileStore, FileStorage, FileStorageExt, MemoryFileStore};
/// # async fn example() -> shardstow::Result<()> {
/// let storage: CompositeFileStore<MemoryFileStore> = CompositeFileStore::builder(MemoryFileStore::new())
///     .backend("hash", MemoryFileStore::new())
///     .own_prefix("hash")
///     .build()?;
///
/// let id = storage.save_bytes(b"data").await?;
/// assert!(id.starts_with("hash/"));
/// assert_eq!(storage.get_bytes(&id).await?, b"data");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CompositeFileStore<S: FileStorage> {
    standard: Arc<S>,
    backends: BTreeMap<String, Arc<S>>,
    own_prefix: Option<String>,
}

/// Builder for [`CompositeFileStore`].
#[derive(Debug)]
pub struct CompositeFileStoreBuilder<S: FileStorage> {
    standard: Arc<S>,
    backends: Vec<(String, Arc<S>)>,
    own_prefix: Option<String>,
}

impl<S: FileStorage> CompositeFileStoreBuilder<S> {
    /// Register `store` under `prefix`.
    pub fn backend(mut self, prefix: impl Into<String>, store: impl Into<Arc<S>>) -> Self {
        self.backends.push((prefix.into(), store.into()));
        self
    }

    /// Write new files to the backend registered under `prefix`.
    pub fn own_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.own_prefix = Some(prefix.into());
        self
    }

    /// Validate the routing table and build the composite.
    ///
    /// Fails with [`Error::InvalidConfig`] for empty, duplicate, slash-bearing
    /// or hex-looking prefixes, and with [`Error::UnknownPrefix`] if the own
    /// prefix has no backend.
    pub fn build(self) -> Result<CompositeFileStore<S>> {
        let mut backends = BTreeMap::new();
        for (prefix, store) in self.backends {
            if prefix.is_empty() || prefix.contains('/') {
                return Err(Error::InvalidConfig(format!(
                    "invalid storage prefix: {prefix:?}"
                )));
            }
            if is_shard_segment(&prefix) {
                return Err(Error::InvalidConfig(format!(
                    "storage prefix {prefix:?} is indistinguishable from a shard directory"
                )));
            }
            if backends.insert(prefix.clone(), store).is_some() {
                return Err(Error::InvalidConfig(format!(
                    "storage prefix {prefix:?} registered twice"
                )));
            }
        }

        if let Some(own) = &self.own_prefix
            && !backends.contains_key(own)
        {
            return Err(Error::UnknownPrefix(own.clone()));
        }

        Ok(CompositeFileStore {
            standard: self.standard,
            backends,
            own_prefix: self.own_prefix,
        })
    }
}

/// Where an identifier goes: the backend, the prefix it sits under (if any),
/// and the identifier as the backend knows it.
struct Route<'a, S> {
    prefix: Option<&'a str>,
    backend: &'a Arc<S>,
    id: &'a str,
}

/// Put `prefix` back in front of a backend-local identifier.
fn qualify(prefix: Option<&str>, id: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}/{id}"),
        None => id.to_string(),
    }
}

impl<S: FileStorage> CompositeFileStore<S> {
    /// Start configuring a composite around `standard`.
    pub fn builder(standard: impl Into<Arc<S>>) -> CompositeFileStoreBuilder<S> {
        CompositeFileStoreBuilder {
            standard: standard.into(),
            backends: Vec::new(),
            own_prefix: None,
        }
    }

    /// A composite with only the standard backend.
    pub fn new(standard: impl Into<Arc<S>>) -> Self {
        Self {
            standard: standard.into(),
            backends: BTreeMap::new(),
            own_prefix: None,
        }
    }

    /// Get the standard backend.
    pub fn standard(&self) -> &S {
        &self.standard
    }

    /// Get the backend registered under `prefix`.
    pub fn backend(&self, prefix: &str) -> Option<&S> {
        self.backends.get(prefix).map(|arc| arc.as_ref())
    }

    /// Registered prefixes, sorted.
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Prefix new files are written under, if any.
    pub fn own_prefix(&self) -> Option<&str> {
        self.own_prefix.as_deref()
    }

    fn route<'a>(&'a self, id: &'a str) -> Result<Route<'a, S>> {
        if let Some((head, rest)) = id.split_once('/') {
            if let Some((prefix, backend)) = self.backends.get_key_value(head) {
                return Ok(Route {
                    prefix: Some(prefix.as_str()),
                    backend,
                    id: rest,
                });
            }
            if !is_shard_segment(head) {
                return Err(Error::UnknownPrefix(head.to_string()));
            }
        }
        Ok(Route {
            prefix: None,
            backend: &self.standard,
            id,
        })
    }

    fn write_route(&self) -> (Option<&str>, &Arc<S>) {
        match self
            .own_prefix
            .as_deref()
            .and_then(|own| self.backends.get_key_value(own))
        {
            Some((prefix, backend)) => (Some(prefix.as_str()), backend),
            None => (None, &self.standard),
        }
    }

    /// The standard backend followed by every registered one.
    fn members(&self) -> impl Iterator<Item = (Option<&str>, &Arc<S>)> {
        std::iter::once((None, &self.standard)).chain(
            self.backends
                .iter()
                .map(|(prefix, backend)| (Some(prefix.as_str()), backend)),
        )
    }
}

/// Collapse fan-out results into the first failure, logging every failure.
fn settle<T>(op: &str, results: Vec<(Option<&str>, Result<T>)>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(results.len());
    let mut first_err = None;
    for (prefix, result) in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                warn!(op, prefix = prefix.unwrap_or("<standard>"), error = %e, "backend failed");
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

impl<S: FileStorage> FileStorage for CompositeFileStore<S> {
    fn uri(&self) -> String {
        self.standard.uri()
    }

    async fn save_new_file<R: AsyncRead + Send + Unpin>(&self, input: R) -> Result<String> {
        let (prefix, backend) = self.write_route();
        let id = backend.save_new_file(input).await?;
        Ok(qualify(prefix, &id))
    }

    async fn get_file(&self, id: &str) -> Result<FileReader> {
        let route = self.route(id)?;
        route.backend.get_file(route.id).await
    }

    async fn get_file_range(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FileReader> {
        let route = self.route(id)?;
        route.backend.get_file_range(route.id, offset, length).await
    }

    async fn append_to_file<R: AsyncRead + Send + Unpin>(
        &self,
        input: R,
        id: &str,
        offset: u64,
    ) -> Result<u64> {
        let route = self.route(id)?;
        route.backend.append_to_file(input, route.id, offset).await
    }

    async fn set_file_length(&self, length: u64, id: &str) -> Result<()> {
        let route = self.route(id)?;
        route.backend.set_file_length(length, route.id).await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let route = self.route(id)?;
        route.backend.exists(route.id).await
    }

    async fn delete_file(&self, id: &str) -> Result<bool> {
        let route = self.route(id)?;
        route.backend.delete_file(route.id).await
    }

    async fn delete_files(&self, ids: &[String]) -> Result<BTreeSet<String>> {
        let mut not_deleted = BTreeSet::new();

        let mut buckets: BTreeMap<Option<&str>, (&Arc<S>, Vec<String>)> = BTreeMap::new();
        for id in ids {
            match self.route(id) {
                Ok(route) => buckets
                    .entry(route.prefix)
                    .or_insert_with(|| (route.backend, Vec::new()))
                    .1
                    .push(route.id.to_string()),
                Err(e) => {
                    warn!(%id, error = %e, "cannot route identifier for deletion");
                    not_deleted.insert(id.clone());
                }
            }
        }

        for (prefix, (backend, bucket)) in buckets {
            match backend.delete_files(&bucket).await {
                Ok(residual) => {
                    not_deleted.extend(residual.iter().map(|id| qualify(prefix, id)));
                }
                Err(e) => {
                    warn!(prefix = prefix.unwrap_or("<standard>"), error = %e, "bulk delete failed");
                    not_deleted.extend(bucket.iter().map(|id| qualify(prefix, id)));
                }
            }
        }

        debug!(
            requested = ids.len(),
            not_deleted = not_deleted.len(),
            "bulk delete finished"
        );
        Ok(not_deleted)
    }

    async fn get_file_size(&self, id: &str) -> Result<u64> {
        let route = self.route(id)?;
        route.backend.get_file_size(route.id).await
    }

    fn get_mime_type(&self, name: &str) -> String {
        self.standard.get_mime_type(name)
    }

    async fn get_file_list(&self) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for (prefix, backend) in self.members() {
            let listed = backend.get_file_list().await?;
            ids.extend(listed.iter().map(|id| qualify(prefix, id)));
        }
        Ok(ids)
    }

    async fn state_file_is_correct(&self) -> Result<bool> {
        let results = join_all(
            self.members()
                .map(|(prefix, backend)| async move { (prefix, backend.state_file_is_correct().await) }),
        )
        .await;
        let states = settle("state_file_is_correct", results)?;
        Ok(states.into_iter().all(|ok| ok))
    }

    async fn recreate_state_file(&self) -> Result<()> {
        let results = join_all(
            self.members()
                .map(|(prefix, backend)| async move { (prefix, backend.recreate_state_file().await) }),
        )
        .await;
        settle("recreate_state_file", results).map(|_| ())
    }

    async fn remove(&self) -> Result<()> {
        let results = join_all(
            self.members()
                .map(|(prefix, backend)| async move { (prefix, backend.remove().await) }),
        )
        .await;
        settle("remove", results).map(|_| ())
    }
}
