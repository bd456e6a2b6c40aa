//! Basic operations on a [`ShardedFileStore`].
//!
//! Run with:
//! ```sh
//! cargo run --example basic --features="local"
//! ```

use shardstow::{FileStorage, FileStorageExt, ShardLayout, ShardedFileStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    let storage = ShardedFileStore::builder(dir.path())
        .layout(ShardLayout::new(2, 2))
        .open()
        .await?;

    // Write
    let id = storage.save_bytes(b"Hello, World!").await?;
    println!("Saved as {id} under {}", storage.uri());

    // Read, whole and partial
    println!("Content: {}", storage.get_string(&id).await?);
    let head = storage.get_range_bytes(&id, 0, Some(5)).await?;
    println!("First five bytes: {}", String::from_utf8_lossy(&head));

    // Append in place
    let len = storage
        .append_to_file(std::io::Cursor::new(b" Bye."), &id, 13)
        .await?;
    println!("Length after append: {len}");
    println!("MIME type of notes.txt: {}", storage.get_mime_type("notes.txt"));

    // Delete; the empty shard directories go with it
    storage.delete_file(&id).await?;
    println!("Exists: {}", storage.exists(&id).await?);
    println!("Files left: {}", storage.get_file_list().await?.len());

    Ok(())
}
