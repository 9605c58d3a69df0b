//! Filesystem seam used by every mutating operation.
//!
//! The splice logic (merge, rip, split, pack) talks to [`Fs`] only, so it can
//! be exercised against a wrapper that simulates files locked by another
//! process.  [`StdFs`] is the production implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

pub trait FsFile: Read + Write + Seek {
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    fn sync_all(&mut self) -> io::Result<()>;
}

impl FsFile for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self)
    }
}

pub trait Fs {
    type File: FsFile;

    /// Open an existing file for reading.
    fn open(&self, path: &Path) -> io::Result<Self::File>;
    /// Open an existing file for reading and writing, without truncation.
    /// Fails when another process holds the file.
    fn open_rw(&self, path: &Path) -> io::Result<Self::File>;
    /// Create a uniquely named empty file in the directory of `beside`.
    fn create_temp(&self, beside: &Path) -> io::Result<(PathBuf, Self::File)>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn len(&self, path: &Path) -> io::Result<u64>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Whether two paths name the same file, whether or not either exists.
    fn same_file(&self, a: &Path, b: &Path) -> bool;
    /// Give `to` the permission bits of `from`, so a rewritten executable
    /// stays executable.
    fn copy_permissions(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Fail early if `path` exists but cannot be opened for writing.
    fn check_writable(&self, path: &Path) -> io::Result<()> {
        if self.exists(path) {
            self.open_rw(path).map(drop)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdFs;

impl Fs for StdFs {
    type File = File;

    fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn open_rw(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(path)
    }

    fn create_temp(&self, beside: &Path) -> io::Result<(PathBuf, File)> {
        let dir = parent_dir(beside);
        let temp = tempfile::Builder::new().prefix(".pck-").suffix(".tmp").tempfile_in(dir)?;
        let (file, path) = temp.keep().map_err(|e| e.error)?;
        Ok((path, file))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        fs::metadata(path).map(|m| m.len())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn same_file(&self, a: &Path, b: &Path) -> bool {
        absolute(a) == absolute(b)
    }

    fn copy_permissions(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::set_permissions(to, fs::metadata(from)?.permissions())
    }
}

/// Canonical form when the file exists, otherwise the canonical parent
/// joined with the file name.
fn absolute(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
            parent.canonicalize().map(|p| p.join(name)).unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// A temp file beside its final destination.  Removed on drop unless
/// [`TempFile::commit`] renamed it into place.
pub struct TempFile<'a, F: Fs> {
    fs:        &'a F,
    path:      PathBuf,
    file:      Option<F::File>,
    committed: bool,
}

impl<'a, F: Fs> TempFile<'a, F> {
    pub fn new(fs: &'a F, beside: &Path) -> io::Result<Self> {
        let (path, file) = fs.create_temp(beside)?;
        Ok(Self { fs, path, file: Some(file), committed: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&mut self) -> io::Result<&mut F::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "temp file already closed"))
    }

    /// Flush, close and rename over `dest`.
    pub fn commit(mut self, dest: &Path) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        self.fs.rename(&self.path, dest)?;
        self.committed = true;
        Ok(())
    }
}

impl<F: Fs> Drop for TempFile<'_, F> {
    fn drop(&mut self) {
        self.file.take();
        if !self.committed {
            if let Err(e) = self.fs.remove(&self.path) {
                tracing::debug!(path = %self.path.display(), error = %e, "temp file cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_file_is_removed_unless_committed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        let temp_path = {
            let mut temp = TempFile::new(&StdFs, &dest).unwrap();
            temp.file().unwrap().write_all(b"discard").unwrap();
            temp.path().to_path_buf()
        };
        assert!(!temp_path.exists());
        assert!(!dest.exists());

        let mut temp = TempFile::new(&StdFs, &dest).unwrap();
        temp.file().unwrap().write_all(b"keep").unwrap();
        temp.commit(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"keep");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn same_file_handles_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pck");
        let dotted = dir.path().join(".").join("a.pck");
        assert!(StdFs.same_file(&a, &dotted));
        assert!(!StdFs.same_file(&a, &dir.path().join("b.pck")));
        fs::write(&a, b"x").unwrap();
        assert!(StdFs.same_file(&a, &dotted));
    }
}
