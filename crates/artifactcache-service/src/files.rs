//! Blocking file operations backing artifact delivery.
//!
//! Everything in here is meant to run on the blocking thread pool.

use std::fs::File;
use std::io::{self, Seek, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use bytes::Bytes;

/// Creates the private files artifacts are delivered in.
///
/// Files are unlinked right after creation, so they vanish once the last handle to them is
/// closed.
#[derive(Debug, Clone, Default)]
pub struct TempFileProvider {
    dir: Option<PathBuf>,
}

impl TempFileProvider {
    /// Creates files in `dir`, or in the system temp directory if `None`.
    ///
    /// The directory is not created and has to exist once files are requested.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn create(&self) -> io::Result<File> {
        match self.dir {
            Some(ref dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }
    }
}

/// Moves artifacts between delivery files and memory.
#[derive(Debug, Clone, Copy)]
pub struct FileWriter {
    max_artifact_size: u64,
}

impl FileWriter {
    pub fn new(max_artifact_size: u64) -> Self {
        Self { max_artifact_size }
    }

    /// Replaces the contents of `file` with `contents`.
    ///
    /// On success, the file is handed back positioned at its start. Artifacts exceeding the
    /// size limit are refused.
    pub fn write(&self, mut file: File, contents: &[u8]) -> io::Result<File> {
        let len = contents.len() as u64;
        if len > self.max_artifact_size {
            return Err(self.too_large(len));
        }

        file.rewind()?;
        file.write_all(contents)?;
        file.set_len(len)?;
        file.flush()?;
        file.rewind()?;
        Ok(file)
    }

    /// Reads the complete contents of `file` into memory.
    ///
    /// The file is read from its start through positional reads. Its position is shared with
    /// every duplicate handed to clients and stays untouched.
    pub fn read_back(&self, file: File) -> io::Result<Bytes> {
        let len = file.metadata()?.len();
        if len > self.max_artifact_size {
            return Err(self.too_large(len));
        }

        let mut contents = vec![0; len as usize];
        file.read_exact_at(&mut contents, 0)?;
        Ok(contents.into())
    }

    fn too_large(&self, len: u64) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "artifact of {len} bytes exceeds the limit of {} bytes",
                self.max_artifact_size
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, SeekFrom};

    use super::*;

    #[test]
    fn test_write_truncates() {
        let provider = TempFileProvider::default();
        let writer = FileWriter::new(1024);

        let mut file = provider.create().unwrap();
        file.write_all(b"a much longer previous artifact").unwrap();

        let mut file = writer.write(file, b"short").unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "short");
    }

    #[test]
    fn test_read_back_shared_file() {
        let provider = TempFileProvider::default();
        let writer = FileWriter::new(1024);

        // the client writes through a duplicate, leaving the shared position at the end
        let file = provider.create().unwrap();
        let mut client_file = file.try_clone().unwrap();
        client_file.write_all(b"compiled artifact").unwrap();
        drop(client_file);

        let contents = writer.read_back(file).unwrap();
        assert_eq!(&contents[..], b"compiled artifact");
    }

    #[test]
    fn test_read_back_keeps_position() {
        let provider = TempFileProvider::default();
        let writer = FileWriter::new(1024);

        let file = provider.create().unwrap();
        let mut client_file = file.try_clone().unwrap();
        client_file.write_all(b"compiled artifact").unwrap();
        client_file.seek(SeekFrom::Start(9)).unwrap();

        let contents = writer.read_back(file).unwrap();
        assert_eq!(&contents[..], b"compiled artifact");

        assert_eq!(client_file.stream_position().unwrap(), 9);
        let mut rest = String::new();
        client_file.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "artifact");
    }

    #[test]
    fn test_size_limit() {
        let provider = TempFileProvider::default();
        let writer = FileWriter::new(4);

        let file = provider.create().unwrap();
        let err = writer.write(file, b"too large").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut file = provider.create().unwrap();
        file.write_all(b"too large").unwrap();
        let err = writer.read_back(file).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_missing_temp_dir() {
        let dir = artifactcache_test::tempdir();
        let provider = TempFileProvider::new(Some(dir.path().join("missing")));
        assert!(provider.create().is_err());

        let provider = TempFileProvider::new(Some(dir.path().to_owned()));
        provider.create().unwrap();
        // unlinked right away
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
