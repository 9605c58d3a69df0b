//! Source discovery and the hashing pass that precedes packing.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::crypto::DigestWriter;
use crate::error::{PckError, Result};
use crate::index::normalize_path;
use crate::io_stream::PendingFile;

/// A file on disk and the path it will have inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path:   String,
    pub source: PathBuf,
    pub size:   u64,
}

impl DiscoveredFile {
    /// Describe `source` as `path`, normalising the container path.
    pub fn new(path: &str, source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        let size = fs::metadata(&source).map_err(|e| PckError::io_at(&source, e))?.len();
        Ok(Self { path: normalize_path(path)?, source, size })
    }

    /// Stream the source once for its size and digest.
    pub fn hash(&self) -> Result<PendingFile> {
        let file = File::open(&self.source).map_err(|e| PckError::io_at(&self.source, e))?;
        let mut digest = DigestWriter::new();
        let size = io::copy(&mut BufReader::new(file), &mut digest)
            .map_err(|e| PckError::io_at(&self.source, e))?;
        Ok(PendingFile { path: self.path.clone(), size, digest: digest.finalize() })
    }
}

/// Every regular file under `root`, sorted by container path.  Symlinks are
/// followed; entries that cannot be read or named, including dangling links
/// and link cycles, are skipped with a warning.
pub fn discover(root: &Path) -> Result<Vec<DiscoveredFile>> {
    let meta = fs::metadata(root).map_err(|e| PckError::io_at(root, e))?;
    if !meta.is_dir() {
        return Err(PckError::io_at(root, io::Error::new(io::ErrorKind::InvalidInput, "not a directory")));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let path = match relative.to_str().map(normalize_path) {
            Some(Ok(p)) => p,
            _ => {
                tracing::warn!(path = %entry.path().display(), "skipping file with an unusable name");
                continue;
            }
        };
        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        files.push(DiscoveredFile { path, source: entry.into_path(), size });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(root = %root.display(), files = files.len(), "discovered sources");
    Ok(files)
}

/// Hash every file, preserving order.  Uses Rayon with the `parallel` feature.
pub fn hash_all(files: &[DiscoveredFile]) -> Result<Vec<PendingFile>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        files.par_iter().map(DiscoveredFile::hash).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        files.iter().map(DiscoveredFile::hash).collect()
    }
}
