#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use pckforge::{Fs, StdFs};

pub const KEY_HEX:   &str = "7FDBF68B69B838194A6F1055395225BBA3F1C5689D08D71DCD620A7068F61CBA";
pub const WRONG_HEX: &str = "8FDBF68B69B838194A6F1055395225BBA3F1C5689D08D71DCD620A7068F61CBA";

pub const ASSETS: &[(&str, &[u8])] = &[
    ("project.binary", b"binary project settings"),
    ("scenes/main.scn", b"[gd_scene load_steps=2 format=2]"),
    ("scenes/levels/one.scn", b"level one"),
    ("icon.png", b"\x89PNG\r\n\x1a\n fake image data"),
    ("empty.txt", b""),
];

/// Write [`ASSETS`] below `dir/name` and return that root.
pub fn assets(dir: &Path, name: &str) -> PathBuf {
    let root = dir.join(name);
    for (path, data) in ASSETS {
        let dest = root.join(path);
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(dest, data).unwrap();
    }
    root
}

/// A stand-in executable of `len` bytes.
pub fn host(path: &Path, len: usize) -> Vec<u8> {
    let mut bytes = b"MZ".to_vec();
    bytes.extend((0..len.saturating_sub(2)).map(|i| (i * 7 % 251) as u8));
    bytes.truncate(len);
    fs::write(path, &bytes).unwrap();
    bytes
}

/// Wraps [`StdFs`] and refuses write access to, or reads of, locked paths,
/// the way another process holding the file would.
#[derive(Default)]
pub struct LockingFs {
    inner:  StdFs,
    locked: RefCell<HashSet<PathBuf>>,
    armed:  RefCell<HashSet<PathBuf>>,
}

impl LockingFs {
    pub fn lock(&self, path: &Path) {
        self.locked.borrow_mut().insert(path.to_path_buf());
    }

    pub fn unlock(&self, path: &Path) {
        self.locked.borrow_mut().remove(path);
    }

    /// Let the next access to `path` through, then lock it, as if another
    /// process grabbed the file midway through an operation.
    pub fn lock_after_next_access(&self, path: &Path) {
        self.armed.borrow_mut().insert(path.to_path_buf());
    }

    fn guard(&self, path: &Path) -> io::Result<()> {
        if self.armed.borrow_mut().remove(path) {
            self.lock(path);
            return Ok(());
        }
        if self.locked.borrow().contains(path) {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is locked"))
        } else {
            Ok(())
        }
    }
}

impl Fs for LockingFs {
    type File = File;

    fn open(&self, path: &Path) -> io::Result<File> {
        self.guard(path)?;
        self.inner.open(path)
    }

    fn open_rw(&self, path: &Path) -> io::Result<File> {
        self.guard(path)?;
        self.inner.open_rw(path)
    }

    fn create_temp(&self, beside: &Path) -> io::Result<(PathBuf, File)> {
        self.inner.create_temp(beside)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.guard(from)?;
        self.guard(to)?;
        self.inner.rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.guard(path)?;
        self.inner.remove(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        self.inner.len(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn same_file(&self, a: &Path, b: &Path) -> bool {
        self.inner.same_file(a, b)
    }

    fn copy_permissions(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.copy_permissions(from, to)
    }
}

/// Names of everything directly inside `dir`, sorted.
pub fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
