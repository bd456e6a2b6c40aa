//! Migrating to a second sharded store with [`CompositeFileStore`].
//!
//! Old identifiers keep resolving against the legacy store while new files
//! are written under the `hash/` prefix.
//!
//! Run with:
//! ```sh
//! cargo run --example composite --features="local"
//! ```

use shardstow::{CompositeFileStore, FileStorage, FileStorageExt, ShardedFileStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let dir = tempfile::tempdir()?;

    let legacy = ShardedFileStore::open(dir.path().join("legacy")).await?;
    let old_id = legacy.save_bytes(b"written before the migration").await?;
    println!("legacy file: {old_id}");

    let hashed = ShardedFileStore::open(dir.path().join("hashed")).await?;
    let storage: CompositeFileStore<ShardedFileStore> = CompositeFileStore::builder(legacy)
        .backend("hash", hashed)
        .own_prefix("hash")
        .build()?;

    let new_id = storage.save_bytes(b"written after the migration").await?;
    println!("new file:    {new_id}");

    // Both identifiers resolve through the composite.
    println!("{old_id}: {}", storage.get_string(&old_id).await?);
    println!("{new_id}: {}", storage.get_string(&new_id).await?);

    println!("Files:");
    for id in storage.get_file_list().await? {
        println!("  {id}");
    }

    let not_deleted = storage
        .delete_files(&[old_id, new_id, "archive/00/00/00/0".to_string()])
        .await?;
    println!("Not deleted: {not_deleted:?}");

    println!("State correct: {}", storage.state_file_is_correct().await?);
    storage.remove().await?;

    Ok(())
}
