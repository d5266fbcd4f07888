//! Boot binary extraction and raw image access.
//!
//! Parsing the filesystem inside a disk image is someone else's job; the
//! flasher only needs "give me the bytes of this named file" and "give me a
//! reader over the raw image".

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Bootloader file not found in image: {name}")]
    Missing { name: String },

    #[error("Error reading bootloader file {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Source of named boot binaries.
pub trait ImageExtractor: Send {
    /// Contents of `name`; an empty buffer means the file is not there.
    fn read_file(&mut self, name: &str) -> io::Result<Vec<u8>>;
}

/// Reads named files from a directory, e.g. a mounted boot partition.
#[derive(Debug, Clone)]
pub struct DirectoryExtractor {
    root: PathBuf,
}

impl DirectoryExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageExtractor for DirectoryExtractor {
    fn read_file(&mut self, name: &str) -> io::Result<Vec<u8>> {
        match std::fs::read(self.root.join(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory file table.
#[derive(Debug, Clone, Default)]
pub struct MemoryExtractor {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), data.into());
        self
    }
}

impl ImageExtractor for MemoryExtractor {
    fn read_file(&mut self, name: &str) -> io::Result<Vec<u8>> {
        Ok(self.files.get(name).cloned().unwrap_or_default())
    }
}

/// Read every file in `names`, in order. The first one that is missing or
/// empty fails the whole extraction.
pub fn extract_all<E: ImageExtractor + ?Sized>(
    extractor: &mut E,
    names: &[&str],
) -> Result<Vec<Vec<u8>>, ExtractError> {
    names
        .iter()
        .map(|name| {
            let data = extractor.read_file(name).map_err(|source| ExtractError::Io {
                name: name.to_string(),
                source,
            })?;
            if data.is_empty() {
                return Err(ExtractError::Missing {
                    name: name.to_string(),
                });
            }
            debug!(name, bytes = data.len(), "Extracted");
            Ok(data)
        })
        .collect()
}

/// The raw disk image streamed to the final storage target.
pub trait RawImage: Send {
    /// Size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// A fresh reader positioned at the start of the image.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;
}

/// Image backed by a file on disk. Opened lazily, so a missing file only
/// surfaces when the final stage starts.
#[derive(Debug, Clone)]
pub struct FileImage {
    path: PathBuf,
}

impl FileImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawImage for FileImage {
    fn size(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }
}

impl RawImage for Vec<u8> {
    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(Cursor::new(self.as_slice())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_extractor_in_order() {
        let mut ex = MemoryExtractor::new()
            .with_file("tiboot3.bin", vec![1u8; 128])
            .with_file("tispl.bin", vec![2u8; 4096]);
        let files = extract_all(&mut ex, &["tispl.bin", "tiboot3.bin"]).unwrap();
        assert_eq!(files[0].len(), 4096);
        assert_eq!(files[1].len(), 128);
    }

    #[test]
    fn test_missing_and_empty_files() {
        let mut ex = MemoryExtractor::new()
            .with_file("tiboot3.bin", vec![1u8; 128])
            .with_file("tispl.bin", Vec::new());
        match extract_all(&mut ex, &["tiboot3.bin", "tispl.bin", "u-boot.img"]) {
            Err(ExtractError::Missing { name }) => assert_eq!(name, "tispl.bin"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_directory_extractor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("u-boot.img"), b"uboot").unwrap();

        let mut ex = DirectoryExtractor::new(dir.path());
        assert_eq!(ex.read_file("u-boot.img").unwrap(), b"uboot");
        assert!(ex.read_file("tiboot3.bin").unwrap().is_empty());
    }

    #[test]
    fn test_file_image_is_opened_lazily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw.img");
        let image = FileImage::new(&path);
        assert!(image.open().is_err());

        std::fs::write(&path, vec![9u8; 5000]).unwrap();
        assert_eq!(image.size().unwrap(), 5000);
        let mut buf = Vec::new();
        image.open().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 5000);
    }
}
