//! Staged image storage.
//!
//! Upload transports write the firmware into an [`ImageStore`] under
//! [`STAGED_IMAGE`]; the engine later opens it from there, reads it strictly
//! front to back and closes it by dropping the handle.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek};
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

/// Well-known name of the staged firmware image.
pub const STAGED_IMAGE: &str = "firmware.bin";

/// An open staged image.
pub trait StagedImage: Read + Seek {
    /// Size of the image in bytes.
    fn size(&self) -> u64;
}

/// Flat-file storage holding staged images.
pub trait ImageStore {
    /// Handle type returned by [`ImageStore::open`].
    type Image: StagedImage;

    /// Open `path` for reading.
    ///
    /// Returns [`Error::ImageNotFound`] when nothing is stored there.
    fn open(&mut self, path: &Path) -> Result<Self::Image>;

    /// Replace the content of `path` with everything read from `data`.
    ///
    /// Returns the number of bytes stored.
    fn stage(&mut self, path: &Path, data: &mut dyn Read) -> Result<u64>;
}

/// Store backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

/// Staged image opened from a [`DirStore`].
#[derive(Debug)]
pub struct DirImage {
    file: File,
    size: u64,
}

impl DirStore {
    /// Use `root` as the storage directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a store path below the root, rejecting escapes via `..`.
    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {},
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Error::Config(format!(
                        "Invalid store path: {}",
                        path.display()
                    )));
                },
            }
        }
        Ok(resolved)
    }
}

impl ImageStore for DirStore {
    type Image = DirImage;

    fn open(&mut self, path: &Path) -> Result<DirImage> {
        let full = self.resolve(path)?;
        let file = match File::open(&full) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ImageNotFound(path.to_path_buf()));
            },
            Err(e) => return Err(Error::Io(e)),
        };
        let size = file.metadata()?.len();
        debug!("Opened {} ({size} bytes)", full.display());
        Ok(DirImage { file, size })
    }

    fn stage(&mut self, path: &Path, data: &mut dyn Read) -> Result<u64> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&full)?;
        let written = io::copy(data, &mut file)?;
        file.sync_all()?;
        debug!("Staged {written} bytes at {}", full.display());
        Ok(written)
    }
}

impl Read for DirImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for DirImage {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl StagedImage for DirImage {
    fn size(&self) -> u64 {
        self.size
    }
}

/// Store kept entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` at `path`, replacing any previous content.
    pub fn insert(&mut self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), data.into());
    }

    /// Remove `path` from the store.
    pub fn remove(&mut self, path: &Path) -> Option<Vec<u8>> {
        self.files.remove(path)
    }

    /// Content stored at `path`.
    pub fn get(&self, path: &Path) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }
}

impl ImageStore for MemoryStore {
    type Image = Cursor<Vec<u8>>;

    fn open(&mut self, path: &Path) -> Result<Self::Image> {
        self.files
            .get(path)
            .cloned()
            .map(Cursor::new)
            .ok_or_else(|| Error::ImageNotFound(path.to_path_buf()))
    }

    fn stage(&mut self, path: &Path, data: &mut dyn Read) -> Result<u64> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let len = buf.len() as u64;
        self.files.insert(path.to_path_buf(), buf);
        Ok(len)
    }
}

impl StagedImage for Cursor<Vec<u8>> {
    fn size(&self) -> u64 {
        self.get_ref().len() as u64
    }
}

impl<S: ImageStore + ?Sized> ImageStore for &mut S {
    type Image = S::Image;

    fn open(&mut self, path: &Path) -> Result<Self::Image> {
        (**self).open(path)
    }

    fn stage(&mut self, path: &Path, data: &mut dyn Read) -> Result<u64> {
        (**self).stage(path, data)
    }
}
