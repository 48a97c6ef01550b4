use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{BackendError, CacheBackend, CacheKey};

/// The directory inside the cache root holding partially written entries.
const TMP_DIR: &str = ".tmp";

/// A [`CacheBackend`] storing every artifact as a file below a root directory.
///
/// Entries are first written to a temporary file and then atomically moved into place, so
/// readers never observe partial entries. The modification time of an entry is its store time.
#[derive(Debug)]
pub struct FilesystemBackend {
    path: PathBuf,
}

impl FilesystemBackend {
    /// Opens the backend, creating the root directory if it does not exist yet.
    ///
    /// Temporary files left over by a crashed process are removed.
    pub async fn open(path: &Path) -> Result<Self, BackendError> {
        let tmp = path.join(TMP_DIR);
        if fs::try_exists(&tmp).await? {
            fs::remove_dir_all(&tmp).await?;
        }
        fs::create_dir_all(&tmp).await?;

        Ok(Self {
            path: path.to_owned(),
        })
    }
}

#[async_trait]
impl CacheBackend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, BackendError> {
        let abspath = self.path.join(key.cache_path());
        tracing::trace!("Fetching artifact from {}", abspath.display());
        match fs::read(&abspath).await {
            Ok(contents) => Ok(Some(contents.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &CacheKey, contents: Bytes) -> Result<(), BackendError> {
        let abspath = self.path.join(key.cache_path());
        let parent_dir = abspath
            .parent()
            .ok_or_else(|| BackendError::Other("cache entry has no parent directory".into()))?;
        fs::create_dir_all(parent_dir).await?;

        let temp_dir = self.path.join(TMP_DIR);
        fs::create_dir_all(&temp_dir).await?;
        let temp_file = NamedTempFile::new_in(&temp_dir)?;
        let dup_file = temp_file.reopen()?;
        let mut dest = fs::File::from_std(dup_file);

        dest.write_all(&contents).await?;
        dest.flush().await?;

        temp_file.persist(&abspath).map_err(|err| err.error)?;
        tracing::trace!(
            "Stored artifact of {} bytes at {}",
            contents.len(),
            abspath.display()
        );
        Ok(())
    }

    async fn doom_between(
        &self,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<usize, BackendError> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            doom_directory_recursive(&root, true, start..end, &mut removed)?;
            Ok::<_, io::Error>(removed)
        })
        .await
        .map_err(|err| BackendError::Other(err.to_string()))?
        .map_err(BackendError::from)
    }
}

/// Removes the entries stored within `range` below `directory`.
///
/// Returns `true` if the directory is left empty. Empty directories below the root are pruned.
fn doom_directory_recursive(
    directory: &Path,
    is_root: bool,
    range: std::ops::Range<SystemTime>,
    removed: &mut usize,
) -> io::Result<bool> {
    let entries = match catch_not_found(|| read_dir(directory))? {
        Some(x) => x,
        None => return Ok(true),
    };

    let mut is_empty = true;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if is_root && entry.file_name() == TMP_DIR {
            is_empty = false;
            continue;
        }

        if entry.file_type()?.is_dir() {
            let mut dir_is_empty =
                doom_directory_recursive(&path, false, range.clone(), removed)?;
            if dir_is_empty {
                tracing::trace!("Removing directory `{}`", path.display());
                if let Err(e) = remove_dir(&path) {
                    tracing::error!("Failed to remove cache directory: {:?}", e);
                    dir_is_empty = false;
                }
            }
            is_empty &= dir_is_empty;
        } else {
            let modified = entry.metadata()?.modified()?;
            if range.contains(&modified) {
                tracing::trace!("Dooming cache entry `{}`", path.display());
                if catch_not_found(|| remove_file(&path))?.is_some() {
                    *removed += 1;
                }
            } else {
                is_empty = false;
            }
        }
    }

    Ok(is_empty)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use filetime::FileTime;

    use super::*;

    #[tokio::test]
    async fn test_store_and_fetch() {
        artifactcache_test::setup();
        let cache_dir = artifactcache_test::tempdir();
        let backend = FilesystemBackend::open(cache_dir.path()).await.unwrap();

        let key = CacheKey::for_testing("foo");
        assert_eq!(backend.get(&key).await.unwrap(), None);

        backend
            .put(&key, Bytes::from_static(b"first"))
            .await
            .unwrap();
        backend
            .put(&key, Bytes::from_static(b"second"))
            .await
            .unwrap();

        assert_eq!(
            backend.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"second"))
        );
        assert!(cache_dir.path().join(key.cache_path()).is_file());

        // nothing is left behind in the temp directory
        let leftovers = read_dir(cache_dir.path().join(TMP_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_open_clears_tmp() {
        artifactcache_test::setup();
        let cache_dir = artifactcache_test::tempdir();
        let tmp = cache_dir.path().join(TMP_DIR);
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("partial"), b"partial").unwrap();

        FilesystemBackend::open(cache_dir.path()).await.unwrap();

        assert!(tmp.is_dir());
        assert_eq!(read_dir(&tmp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_doom_between() {
        artifactcache_test::setup();
        let cache_dir = artifactcache_test::tempdir();
        let backend = FilesystemBackend::open(cache_dir.path()).await.unwrap();

        let old_key = CacheKey::for_testing("old");
        let new_key = CacheKey::for_testing("new");
        backend
            .put(&old_key, Bytes::from_static(b"old"))
            .await
            .unwrap();
        backend
            .put(&new_key, Bytes::from_static(b"new"))
            .await
            .unwrap();

        // age one of the entries by a day
        let now = SystemTime::now();
        let day_ago = now - Duration::from_secs(24 * 3600);
        let old_path = cache_dir.path().join(old_key.cache_path());
        filetime::set_file_mtime(&old_path, FileTime::from_system_time(day_ago)).unwrap();

        let removed = backend
            .doom_between(now - Duration::from_secs(3600), now + Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        assert_eq!(
            backend.get(&old_key).await.unwrap(),
            Some(Bytes::from_static(b"old"))
        );
        assert_eq!(backend.get(&new_key).await.unwrap(), None);

        // the emptied directories of the doomed entry are pruned
        let new_path = cache_dir.path().join(new_key.cache_path());
        assert!(!new_path.parent().unwrap().exists());
        assert!(cache_dir.path().join(TMP_DIR).is_dir());

        let removed = backend
            .doom_between(day_ago - Duration::from_secs(1), now)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.get(&old_key).await.unwrap(), None);
    }
}
