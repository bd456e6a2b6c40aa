//! Common test utilities and reusable test suite for file storage adapters.
//!
//! The `run_test_*` functions take any [`FileStorage`] and exercise the
//! behaviour every adapter must share. Adapter test files call them with a
//! freshly created store.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use shardstow::{Error, FileReader, FileStorage, FileStorageExt, MemoryFileStore, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Install a tracing subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Individual test implementations that can be reused

pub async fn run_test_save_and_get_bytes<S: FileStorage>(storage: &S) {
    let data = b"hello world";

    let id = storage.save_bytes(data).await.unwrap();

    assert!(storage.exists(&id).await.unwrap());
    assert_eq!(storage.get_bytes(&id).await.unwrap(), data);
}

pub async fn run_test_save_returns_fresh_ids<S: FileStorage>(storage: &S) {
    let first = storage.save_bytes(b"same").await.unwrap();
    let second = storage.save_bytes(b"same").await.unwrap();

    assert_ne!(first, second);
    assert_eq!(storage.get_bytes(&first).await.unwrap(), b"same");
    assert_eq!(storage.get_bytes(&second).await.unwrap(), b"same");
}

pub async fn run_test_empty_data<S: FileStorage>(storage: &S) {
    let id = storage.save_bytes(b"").await.unwrap();

    assert!(storage.exists(&id).await.unwrap());
    assert_eq!(storage.get_file_size(&id).await.unwrap(), 0);
    assert!(storage.get_bytes(&id).await.unwrap().is_empty());
}

pub async fn run_test_large_data<S: FileStorage>(storage: &S) {
    let data: Vec<u8> = (0..1_000_000).map(|i| (i % 251) as u8).collect();

    let id = storage.save_bytes(&data).await.unwrap();

    assert_eq!(storage.get_file_size(&id).await.unwrap(), data.len() as u64);
    assert_eq!(storage.get_bytes(&id).await.unwrap(), data);
}

pub async fn run_test_binary_data<S: FileStorage>(storage: &S) {
    let data: Vec<u8> = (0..=255).collect();

    let id = storage.save_bytes(&data).await.unwrap();

    assert_eq!(storage.get_bytes(&id).await.unwrap(), data);
}

pub async fn run_test_get_nonexistent<S: FileStorage>(storage: &S) {
    let id = "00/00/00/00000000000000000000000000";

    assert!(matches!(storage.get_file(id).await, Err(Error::NotFound(_))));
    assert!(matches!(
        storage.get_file_range(id, 0, Some(1)).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        storage.get_file_size(id).await,
        Err(Error::NotFound(_))
    ));
    assert!(!storage.exists(id).await.unwrap());
}

pub async fn run_test_range_reads<S: FileStorage>(storage: &S) {
    let id = storage.save_bytes(b"0123456789").await.unwrap();

    assert_eq!(
        storage.get_range_bytes(&id, 2, Some(3)).await.unwrap(),
        b"234"
    );
    assert_eq!(
        storage.get_range_bytes(&id, 7, None).await.unwrap(),
        b"789"
    );
    assert_eq!(
        storage.get_range_bytes(&id, 0, Some(10)).await.unwrap(),
        b"0123456789"
    );
    assert!(
        storage
            .get_range_bytes(&id, 10, Some(0))
            .await
            .unwrap()
            .is_empty()
    );

    assert!(matches!(
        storage.get_file_range(&id, 11, None).await,
        Err(Error::InvalidRange { size: 10, .. })
    ));
    assert!(matches!(
        storage.get_file_range(&id, 8, Some(5)).await,
        Err(Error::InvalidRange { offset: 8, .. })
    ));
}

pub async fn run_test_append<S: FileStorage>(storage: &S) {
    let id = storage.save_bytes(b"hello").await.unwrap();

    let len = storage
        .append_to_file(Cursor::new(b" world".to_vec()), &id, 5)
        .await
        .unwrap();

    assert_eq!(len, 11);
    assert_eq!(storage.get_bytes(&id).await.unwrap(), b"hello world");
}

pub async fn run_test_append_out_of_order<S: FileStorage>(storage: &S) {
    let id = storage.save_bytes(b"").await.unwrap();

    // Second chunk lands first, then the gap is filled.
    let len = storage
        .append_to_file(Cursor::new(b"6789".to_vec()), &id, 6)
        .await
        .unwrap();
    assert_eq!(len, 10);

    let len = storage
        .append_to_file(Cursor::new(b"012345".to_vec()), &id, 0)
        .await
        .unwrap();
    assert_eq!(len, 10);

    assert_eq!(storage.get_bytes(&id).await.unwrap(), b"0123456789");
}

pub async fn run_test_append_keeps_surrounding_bytes<S: FileStorage>(storage: &S) {
    let id = storage.save_bytes(b"aaaaaaaaaa").await.unwrap();

    let len = storage
        .append_to_file(Cursor::new(b"XYZ".to_vec()), &id, 3)
        .await
        .unwrap();

    assert_eq!(len, 10);
    assert_eq!(storage.get_bytes(&id).await.unwrap(), b"aaaXYZaaaa");
}

pub async fn run_test_append_nonexistent<S: FileStorage>(storage: &S) {
    let result = storage
        .append_to_file(
            Cursor::new(b"data".to_vec()),
            "00/00/00/00000000000000000000000000",
            0,
        )
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

pub async fn run_test_set_file_length<S: FileStorage>(storage: &S) {
    let id = storage.save_bytes(b"0123456789").await.unwrap();

    storage.set_file_length(4, &id).await.unwrap();
    assert_eq!(storage.get_bytes(&id).await.unwrap(), b"0123");

    storage.set_file_length(6, &id).await.unwrap();
    assert_eq!(storage.get_bytes(&id).await.unwrap(), b"0123\0\0");
    assert_eq!(storage.get_file_size(&id).await.unwrap(), 6);

    assert!(matches!(
        storage
            .set_file_length(1, "00/00/00/00000000000000000000000000")
            .await,
        Err(Error::NotFound(_))
    ));
}

pub async fn run_test_delete_twice<S: FileStorage>(storage: &S) {
    let id = storage.save_bytes(b"data").await.unwrap();

    assert!(storage.delete_file(&id).await.unwrap());
    assert!(!storage.delete_file(&id).await.unwrap());
    assert!(!storage.exists(&id).await.unwrap());
    assert!(matches!(storage.get_file(&id).await, Err(Error::NotFound(_))));
}

pub async fn run_test_delete_unknown<S: FileStorage>(storage: &S) {
    assert!(
        !storage
            .delete_file("00/00/00/00000000000000000000000000")
            .await
            .unwrap()
    );
}

pub async fn run_test_delete_files_residual<S: FileStorage>(storage: &S) {
    let known1 = storage.save_bytes(b"one").await.unwrap();
    let known2 = storage.save_bytes(b"two").await.unwrap();
    let unknown1 = "00/00/00/00000000000000000000000001".to_string();
    let unknown2 = "00/00/00/00000000000000000000000002".to_string();

    let not_deleted = storage
        .delete_files(&[known1.clone(), unknown1.clone(), known2.clone(), unknown2.clone()])
        .await
        .unwrap();

    assert_eq!(not_deleted, BTreeSet::from([unknown1, unknown2]));
    assert!(!storage.exists(&known1).await.unwrap());
    assert!(!storage.exists(&known2).await.unwrap());
}

pub async fn run_test_file_list_sorted<S: FileStorage>(storage: &S) {
    let mut saved = Vec::new();
    for i in 0..20 {
        saved.push(storage.save_bytes(format!("file {i}").as_bytes()).await.unwrap());
    }

    let listed = storage.get_file_list().await.unwrap();
    let expected: BTreeSet<String> = saved.iter().cloned().collect();
    assert_eq!(listed, expected);

    let as_vec: Vec<&String> = listed.iter().collect();
    let mut sorted = as_vec.clone();
    sorted.sort();
    assert_eq!(as_vec, sorted);
}

pub async fn run_test_out_of_range_sizes<S: FileStorage>(storage: &S) {
    let id = storage.save_bytes(b"data").await.unwrap();

    let result = storage
        .append_to_file(Cursor::new(b"x".to_vec()), &id, u64::MAX)
        .await;
    assert!(result.is_err(), "append at u64::MAX: {result:?}");

    let result = storage.set_file_length(u64::MAX, &id).await;
    assert!(result.is_err(), "length u64::MAX: {result:?}");

    assert_eq!(storage.get_bytes(&id).await.unwrap(), b"data");
}

pub async fn run_test_mime_type<S: FileStorage>(storage: &S) {
    assert_eq!(storage.get_mime_type("report.pdf"), "application/pdf");
    assert_eq!(storage.get_mime_type("README"), "application/octet-stream");
}

pub async fn run_test_state_file<S: FileStorage>(storage: &S) {
    assert!(storage.state_file_is_correct().await.unwrap());
    storage.recreate_state_file().await.unwrap();
    assert!(storage.state_file_is_correct().await.unwrap());
}

pub async fn run_test_stream<S: FileStorage>(storage: &S) {
    use futures::StreamExt;

    let data: Vec<u8> = (0..200_000).map(|i| (i % 256) as u8).collect();
    let id = storage.save_bytes(&data).await.unwrap();

    let mut stream = storage.get_stream(&id).await.unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, data);
}

/// Storage call as seen by a [`RecordingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub id: Option<String>,
}

/// Wraps a [`MemoryFileStore`] and records every call it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingStore {
    pub inner: MemoryFileStore,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_state_ops: bool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `remove` / `recreate_state_file` / `state_file_is_correct`
    /// fail after recording the call.
    pub fn failing() -> Self {
        Self {
            fail_state_ops: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, op: &str) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.id)
            .collect()
    }

    fn record(&self, op: &'static str, id: Option<&str>) {
        self.calls.lock().unwrap().push(Call {
            op,
            id: id.map(str::to_string),
        });
    }

    fn state_op_result(&self) -> Result<()> {
        if self.fail_state_ops {
            Err(Error::Generic("backend unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl FileStorage for RecordingStore {
    fn uri(&self) -> String {
        self.inner.uri()
    }

    async fn save_new_file<R: AsyncRead + Send + Unpin>(&self, mut input: R) -> Result<String> {
        self.record("save_new_file", None);
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).await?;
        self.inner.save_new_file(Cursor::new(buf)).await
    }

    async fn get_file(&self, id: &str) -> Result<FileReader> {
        self.record("get_file", Some(id));
        self.inner.get_file(id).await
    }

    async fn get_file_range(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FileReader> {
        self.record("get_file_range", Some(id));
        self.inner.get_file_range(id, offset, length).await
    }

    async fn append_to_file<R: AsyncRead + Send + Unpin>(
        &self,
        input: R,
        id: &str,
        offset: u64,
    ) -> Result<u64> {
        self.record("append_to_file", Some(id));
        self.inner.append_to_file(input, id, offset).await
    }

    async fn set_file_length(&self, length: u64, id: &str) -> Result<()> {
        self.record("set_file_length", Some(id));
        self.inner.set_file_length(length, id).await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        self.record("exists", Some(id));
        self.inner.exists(id).await
    }

    async fn delete_file(&self, id: &str) -> Result<bool> {
        self.record("delete_file", Some(id));
        self.inner.delete_file(id).await
    }

    async fn delete_files(&self, ids: &[String]) -> Result<BTreeSet<String>> {
        for id in ids {
            self.record("delete_files", Some(id));
        }
        self.inner.delete_files(ids).await
    }

    async fn get_file_size(&self, id: &str) -> Result<u64> {
        self.record("get_file_size", Some(id));
        self.inner.get_file_size(id).await
    }

    fn get_mime_type(&self, name: &str) -> String {
        self.record("get_mime_type", Some(name));
        self.inner.get_mime_type(name)
    }

    async fn get_file_list(&self) -> Result<BTreeSet<String>> {
        self.record("get_file_list", None);
        self.inner.get_file_list().await
    }

    async fn state_file_is_correct(&self) -> Result<bool> {
        self.record("state_file_is_correct", None);
        self.state_op_result()?;
        self.inner.state_file_is_correct().await
    }

    async fn recreate_state_file(&self) -> Result<()> {
        self.record("recreate_state_file", None);
        self.state_op_result()?;
        self.inner.recreate_state_file().await
    }

    async fn remove(&self) -> Result<()> {
        self.record("remove", None);
        self.state_op_result()?;
        self.inner.remove().await
    }
}
