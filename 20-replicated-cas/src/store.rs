//! Local blob persistence.
//!
//! Every operation runs its key through the configured [`PathTransform`]
//! and works on `<root>/<shards...>/<filename>`. The store does not
//! serialize writers; two concurrent writes to the same key race.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::path::PathTransform;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    transform: PathTransform,
}

impl BlobStore {
    /// Creates a store rooted at `root`. The directory is created on the first write.
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        Self {
            root: root.into(),
            transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transform(&self) -> PathTransform {
        self.transform
    }

    /// Absolute location of `key` under the root.
    pub fn location(&self, key: &str) -> PathBuf {
        self.root.join(self.transform.apply(key).full_path())
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.location(key)).await?)
    }

    /// Opens the blob for `key`, returning its length and a reader at offset 0.
    pub async fn read(&self, key: &str) -> Result<(u64, File)> {
        let file = File::open(self.location(key))
            .await
            .map_err(|err| not_found_or(err, key))?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Copies `source` into the blob for `key` until it is exhausted.
    ///
    /// Existing content is truncated. On failure the file is left as far as
    /// it got; overwrite it to recover.
    pub async fn write<R>(&self, key: &str, mut source: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let key_path = self.transform.apply(key);
        let directory = self.root.join(key_path.directory());
        fs::create_dir_all(&directory).await?;

        let path = directory.join(&key_path.filename);
        let mut file = File::create(&path).await?;
        let written = tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;

        debug!(key, path = %path.display(), bytes = written, "blob written");
        Ok(written)
    }

    /// Removes the blob's shard directory and any parent shard directory left
    /// empty by it. The root itself is never removed.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let key_path = self.transform.apply(key);
        let directory = self.root.join(key_path.directory());

        fs::metadata(&directory)
            .await
            .map_err(|err| not_found_or(err, key))?;
        fs::remove_dir_all(&directory).await?;

        let mut parent = directory.parent();
        while let Some(dir) = parent {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            // Fails on a directory still holding other blobs; that's where we stop.
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            parent = dir.parent();
        }

        debug!(key, "blob deleted");
        Ok(())
    }

    /// Removes the whole root. Succeeds when the root is already gone.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn not_found_or(err: io::Error, key: &str) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotFound(key.to_string())
    } else {
        Error::Io(err)
    }
}
