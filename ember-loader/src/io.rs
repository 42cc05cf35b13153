use crate::{LoaderError, LoaderResult};
use std::collections::HashMap;
use std::path::PathBuf;

/// Byte/string provider keyed by path. Implementations are called from arbitrary worker
/// threads inside background decode jobs and must never touch the graphics context.
pub trait IoReader: Send + Sync {
    fn get_bytes(
        &self,
        path: &str,
    ) -> LoaderResult<Vec<u8>>;

    fn get_string(
        &self,
        path: &str,
    ) -> LoaderResult<String> {
        let bytes = self.get_bytes(path)?;
        String::from_utf8(bytes)
            .map_err(|_| LoaderError::StringError(format!("{} is not valid utf-8", path)))
    }

    fn is_present(
        &self,
        path: &str,
    ) -> bool;
}

/// Reads assets from a root directory on disk.
pub struct DiskReader {
    root: PathBuf,
}

impl DiskReader {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        DiskReader { root: root.into() }
    }

    fn resolve(
        &self,
        path: &str,
    ) -> PathBuf {
        self.root.join(path)
    }
}

impl IoReader for DiskReader {
    fn get_bytes(
        &self,
        path: &str,
    ) -> LoaderResult<Vec<u8>> {
        profiling::scope!("DiskReader::get_bytes");
        match std::fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                log::warn!("could not read {}: {}", path, e);
                Err(e.into())
            }
        }
    }

    fn is_present(
        &self,
        path: &str,
    ) -> bool {
        self.resolve(path).exists()
    }
}

/// In-memory path→bytes map. Used by tests and tooling that stage assets without a
/// filesystem.
#[derive(Default)]
pub struct MemoryReader {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>, B: Into<Vec<u8>>>(
        &mut self,
        path: S,
        bytes: B,
    ) {
        self.files.insert(path.into(), bytes.into());
    }
}

impl IoReader for MemoryReader {
    fn get_bytes(
        &self,
        path: &str,
    ) -> LoaderResult<Vec<u8>> {
        match self.files.get(path) {
            Some(bytes) => Ok(bytes.clone()),
            None => {
                log::warn!("could not read {}: not present", path);
                Err(LoaderError::MissingResource(path.to_string()))
            }
        }
    }

    fn is_present(
        &self,
        path: &str,
    ) -> bool {
        self.files.contains_key(path)
    }
}
