//! Key-to-path transforms.
//!
//! A transform decides where a key lives below the store root. Peers must
//! run the same transform, since a `GetFile` only finds a blob if both sides
//! derive the same location from the key.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

/// Width, in hex characters, of one shard directory segment.
const SHARD_WIDTH: usize = 5;

/// Location of a key relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    /// Directory segments, outermost first.
    pub shards: Vec<String>,
    /// File name inside the innermost shard directory.
    pub filename: String,
}

impl KeyPath {
    /// The shard directories joined into one relative path.
    pub fn directory(&self) -> PathBuf {
        self.shards.iter().collect()
    }

    /// Directory plus file name.
    pub fn full_path(&self) -> PathBuf {
        self.directory().join(&self.filename)
    }
}

/// How keys are mapped onto the filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathTransform {
    /// `<key>/<key>`.
    Identity,
    /// SHA-1 of the key, hex encoded and sliced into five-character shards.
    #[default]
    ContentAddressed,
}

impl PathTransform {
    pub fn apply(&self, key: &str) -> KeyPath {
        match self {
            PathTransform::Identity => KeyPath {
                shards: vec![key.to_string()],
                filename: key.to_string(),
            },
            PathTransform::ContentAddressed => content_addressed(key),
        }
    }
}

fn content_addressed(key: &str) -> KeyPath {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    // 40 hex characters split evenly into 8 segments.
    let shards = digest
        .as_bytes()
        .chunks(SHARD_WIDTH)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();

    KeyPath {
        shards,
        filename: digest,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn content_addressed_matches_known_vector() {
        let path = PathTransform::ContentAddressed.apply("helloWorld");
        assert_eq!(path.filename, "5395ebfd174b0a5617e6f409dfbb3e064e3fdf0a");
        assert_eq!(
            path.shards.join("/"),
            "5395e/bfd17/4b0a5/617e6/f409d/fbb3e/064e3/fdf0a"
        );
        assert_eq!(
            path.full_path(),
            Path::new("5395e/bfd17/4b0a5/617e6/f409d/fbb3e/064e3/fdf0a")
                .join("5395ebfd174b0a5617e6f409dfbb3e064e3fdf0a")
        );
    }

    #[test]
    fn content_addressed_is_deterministic() {
        let first = PathTransform::ContentAddressed.apply("some key");
        let second = PathTransform::ContentAddressed.apply("some key");
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_keys_get_distinct_digests() {
        let a = PathTransform::ContentAddressed.apply("alpha");
        let b = PathTransform::ContentAddressed.apply("beta");
        assert_ne!(a.filename, b.filename);
        assert!(a.shards.iter().all(|shard| shard.len() == SHARD_WIDTH));
    }

    #[test]
    fn identity_uses_key_for_directory_and_file() {
        let path = PathTransform::Identity.apply("photo");
        assert_eq!(path.shards, vec!["photo".to_string()]);
        assert_eq!(path.full_path(), Path::new("photo/photo"));
    }
}
