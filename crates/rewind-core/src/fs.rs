use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("file is not valid utf-8: {0}")]
    NotUtf8(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

/// Seam between the checkpoint/revert logic and the disk.
pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> Result<String, FsError>;
    fn write(&self, path: &Path, content: &str) -> Result<(), FsError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn read(&self, path: &Path) -> Result<String, FsError> {
        let bytes = fs::read(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
            _ => FsError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        })?;
        String::from_utf8(bytes).map_err(|_| FsError::NotUtf8(path.to_path_buf()))
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), FsError> {
        let io_err = |source| FsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, content).map_err(io_err)
    }
}
