//! Shard key derivation and identifier shape.
//!
//! Every saved object gets a fresh 128-bit random token, hex encoded. The
//! first `depth * width` characters become nested directory names, the rest
//! becomes the leaf file name:
//!
//! ```text
//! token  3f9a1c0e7b2d4e8f9a0b1c2d3e4f5a6b
//! id     3f/9a/1c/0e7b2d4e8f9a0b1c2d3e4f5a6b
//! ```
//!
//! Each directory level therefore holds at most `16^width` children no matter
//! how many objects the store accumulates.

use std::path::{Component, Path};

use uuid::Uuid;

use crate::{Error, Result};

/// Hex characters in a shard token.
const TOKEN_LEN: usize = 32;

/// Shortest leaf name a layout may leave behind.
const MIN_LEAF_LEN: usize = 8;

/// Directory fan-out scheme for a sharded store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "local", derive(serde::Serialize, serde::Deserialize))]
pub struct ShardLayout {
    /// Number of nested shard directories.
    pub depth: usize,
    /// Hex characters per shard directory name.
    pub width: usize,
}

impl Default for ShardLayout {
    fn default() -> Self {
        Self { depth: 3, width: 2 }
    }
}

impl ShardLayout {
    /// Create a layout with `depth` levels of `width`-character directories.
    pub fn new(depth: usize, width: usize) -> Self {
        Self { depth, width }
    }

    /// Check that the layout leaves a usable leaf name, failing with [`Error::InvalidConfig`].
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 || self.width == 0 {
            return Err(Error::InvalidConfig(format!(
                "shard depth and width must be positive (got depth {}, width {})",
                self.depth, self.width
            )));
        }
        if self.depth * self.width > TOKEN_LEN - MIN_LEAF_LEN {
            return Err(Error::InvalidConfig(format!(
                "shard layout {}x{} leaves fewer than {MIN_LEAF_LEN} characters for the leaf name",
                self.depth, self.width
            )));
        }
        Ok(())
    }

    /// Derive a fresh identifier.
    pub fn new_identifier(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let split = self.depth * self.width;

        let mut id = String::with_capacity(TOKEN_LEN + self.depth);
        for start in (0..split).step_by(self.width) {
            id.push_str(&token[start..start + self.width]);
            id.push('/');
        }
        id.push_str(&token[split..]);
        id
    }

    /// Whether `id` has the shape this layout produces.
    pub fn is_identifier(&self, id: &str) -> bool {
        let segments: Vec<&str> = id.split('/').collect();
        if segments.len() != self.depth + 1 {
            return false;
        }
        let (dirs, leaf) = segments.split_at(self.depth);
        dirs.iter()
            .all(|s| s.len() == self.width && is_shard_segment(s))
            && leaf[0].len() == TOKEN_LEN - self.depth * self.width
            && is_shard_segment(leaf[0])
    }
}

/// Whether `segment` could be a shard directory name (non-empty lowercase hex).
///
/// Composite prefixes are never allowed to look like this.
pub fn is_shard_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Reject identifiers that would escape a store root.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Generic("id cannot be empty".into()));
    }

    let p = Path::new(id);

    if p.is_absolute() {
        return Err(Error::PermissionDenied(format!(
            "absolute paths are not allowed: {id}"
        )));
    }

    for c in p.components() {
        match c {
            Component::ParentDir => {
                return Err(Error::PermissionDenied(format!(
                    "parent dir components ('..') are not allowed: {id}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(Error::PermissionDenied(format!(
                    "rooted paths are not allowed: {id}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    // `Path::components` drops inner `.` and empty segments, generated
    // identifiers never contain them.
    if id.split('/').any(|segment| segment.is_empty() || segment == ".") {
        return Err(Error::PermissionDenied(format!(
            "non-canonical identifiers are not allowed: {id}"
        )));
    }

    Ok(())
}
