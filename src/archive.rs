//! High-level API: [`PckTool`] for whole-file operations and [`PckArchive`]
//! for read sessions.
//!
//! ```no_run
//! use pckforge::{PackOptions, PackSource, PckTool, StdFs};
//! use std::path::Path;
//!
//! let tool = PckTool::new(StdFs);
//! tool.pack(
//!     &PackSource::Directory("assets".into()),
//!     Path::new("game.pck"),
//!     "2.4.2.0",
//!     &PackOptions::default(),
//! )?;
//!
//! let mut session = tool.open(Path::new("game.pck"), None)?;
//! let settings = session.read_entry("project.binary")?;
//! session.close();
//!
//! println!("{}", tool.print_info(Path::new("game.pck"), false, None)?);
//! # let _ = settings;
//! # Ok::<(), pckforge::PckError>(())
//! ```

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::crypto::EncryptionKey;
use crate::embed::EmbedState;
use crate::error::{FormatError, PckError, Result};
use crate::fs::{Fs, StdFs};
use crate::header::PckHeader;
use crate::index::{PckEntry, PckIndex};
use crate::io_stream::PckReader;
use crate::version::PckVersion;

/// Upper bound on the buffer reserved up front by [`PckArchive::read_entry`];
/// sizes come from the index and are not trusted.
const PREALLOC_LIMIT: u64 = 1 << 20;

// ── PckTool ───────────────────────────────────────────────────────────────────

/// Entry point for every operation that touches the filesystem.
#[derive(Debug, Clone)]
pub struct PckTool<F: Fs = StdFs> {
    fs: F,
}

impl Default for PckTool<StdFs> {
    fn default() -> Self {
        Self::new(StdFs)
    }
}

impl<F: Fs> PckTool<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Find the container inside `path`.  Without `scan_embedded` the whole
    /// file is taken to be the container.
    pub fn locate(&self, path: &Path, scan_embedded: bool) -> Result<Location> {
        locate(&self.fs, path, scan_embedded)
    }

    pub(crate) fn reader(&self, location: &Location) -> Result<PckReader<F::File>> {
        reader(&self.fs, location)
    }

    pub(crate) fn read_header(&self, location: &Location) -> Result<PckHeader> {
        self.reader(location)?.read_header()
    }

    /// OpenPCK: start a read session on a standalone or embedded container.
    pub fn open(&self, path: &Path, key: Option<EncryptionKey>) -> Result<PckArchive<'_, F>> {
        PckArchive::open(&self.fs, path, key)
    }

    /// PrintInfo: summarise the container at `path` and log the summary.
    pub fn print_info(&self, path: &Path, scan_embedded: bool, key: Option<&EncryptionKey>) -> Result<PckInfo> {
        let location = self.locate(path, scan_embedded)?;
        let (header, index) = self.reader(&location)?.read_index(key)?;
        let info = PckInfo::new(&location, &header, &index);
        tracing::info!(
            path = %path.display(),
            version = %info.version,
            entries = info.entries.len(),
            embedded = info.embedded,
            "container info"
        );
        Ok(info)
    }
}

// ── Location ──────────────────────────────────────────────────────────────────

/// Where a container lives: the whole file, or a region of a merged host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path:     PathBuf,
    pub embedded: bool,
    pub offset:   u64,
    pub len:      u64,
}

pub(crate) fn locate<F: Fs>(fs: &F, path: &Path, scan_embedded: bool) -> Result<Location> {
    let state = if scan_embedded {
        EmbedState::probe(fs, path)?
    } else {
        EmbedState::NotEmbedded { host_len: fs.len(path).map_err(|e| PckError::io_at(path, e))? }
    };
    let (embedded, offset, len) = match state {
        EmbedState::Embedded(footer) => (true, footer.container_offset, footer.container_len),
        EmbedState::NotEmbedded { host_len } => (false, 0, host_len),
    };
    tracing::debug!(path = %path.display(), embedded, offset, len, "located container");
    Ok(Location { path: path.to_path_buf(), embedded, offset, len })
}

fn reader<F: Fs>(fs: &F, location: &Location) -> Result<PckReader<F::File>> {
    let file = fs.open(&location.path).map_err(|e| PckError::io_at(&location.path, e))?;
    Ok(PckReader::new(file, location.offset, location.len))
}

// ── PckArchive ────────────────────────────────────────────────────────────────

/// An open container.  Holds the parsed header and index; the file itself
/// is reopened for each read, so nothing stays locked between calls.
pub struct PckArchive<'a, F: Fs = StdFs> {
    fs:       &'a F,
    location: Location,
    header:   PckHeader,
    index:    PckIndex,
    key:      Option<EncryptionKey>,
}

impl<'a, F: Fs> PckArchive<'a, F> {
    pub fn open(fs: &'a F, path: &Path, key: Option<EncryptionKey>) -> Result<Self> {
        let location = locate(fs, path, true)?;
        let (header, index) = reader(fs, &location)?.read_index(key.as_ref())?;
        tracing::debug!(path = %path.display(), entries = index.len(), "session opened");
        Ok(Self { fs, location, header, index, key })
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn header(&self) -> &PckHeader {
        &self.header
    }

    pub fn version(&self) -> PckVersion {
        self.header.version
    }

    pub fn list(&self) -> impl Iterator<Item = &PckEntry> {
        self.index.iter()
    }

    pub fn stat(&self, path: &str) -> Option<&PckEntry> {
        self.index.get(path)
    }

    /// Read one entry's plaintext.
    pub fn read_entry(&mut self, path: &str) -> Result<Vec<u8>> {
        let entry = self.index.get(path).ok_or_else(|| {
            PckError::Io(io::Error::new(io::ErrorKind::NotFound, format!("entry not found: {path}")))
        })?;
        if entry.truncated {
            return Err(FormatError::TruncatedEntry(entry.path.clone()).into());
        }
        let mut out = Vec::with_capacity(entry.size.min(PREALLOC_LIMIT) as usize);
        reader(self.fs, &self.location)?.copy_entry(entry, self.key.as_ref(), &mut out)?;
        Ok(out)
    }

    /// ClosePCK.  Dropping the session has the same effect.
    pub fn close(self) {
        tracing::debug!(path = %self.location.path.display(), "session closed");
    }
}

// ── PckInfo ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub path:      String,
    pub offset:    u64,
    pub size:      u64,
    pub digest:    String,
    pub encrypted: bool,
    pub truncated: bool,
}

impl From<&PckEntry> for EntryInfo {
    fn from(e: &PckEntry) -> Self {
        EntryInfo {
            path:      e.path.clone(),
            offset:    e.offset,
            size:      e.size,
            digest:    hex::encode(e.digest),
            encrypted: e.encrypted,
            truncated: e.truncated,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PckInfo {
    pub path:             PathBuf,
    pub embedded:         bool,
    pub container_offset: u64,
    pub container_len:    u64,
    pub version:          PckVersion,
    pub index_encrypted:  bool,
    pub file_base:        u64,
    pub total_size:       u64,
    pub entries:          Vec<EntryInfo>,
}

impl PckInfo {
    fn new(location: &Location, header: &PckHeader, index: &PckIndex) -> Self {
        let entries: Vec<EntryInfo> = index.iter().map(EntryInfo::from).collect();
        PckInfo {
            path:             location.path.clone(),
            embedded:         location.embedded,
            container_offset: location.offset,
            container_len:    location.len,
            version:          header.version,
            index_encrypted:  header.revision.index_encrypted(),
            file_base:        header.revision.offset_base(),
            total_size:       entries.iter().fold(0u64, |total, e| total.saturating_add(e.size)),
            entries,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PckError::Io(e.into()))
    }
}

impl fmt::Display for PckInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = &self.version;
        write!(f, "Container: {}", self.path.display())?;
        if self.embedded {
            write!(f, " (embedded at offset {}, {} bytes)", self.container_offset, self.container_len)?;
        }
        writeln!(f)?;
        writeln!(f, "Format revision: {}", v.format)?;
        writeln!(f, "Engine version: {}.{}.{}", v.major, v.minor, v.patch)?;
        writeln!(f, "Version string for this program: {v}")?;
        writeln!(f, "Index encrypted: {}", if self.index_encrypted { "yes" } else { "no" })?;
        writeln!(f, "Files: {} ({} bytes)", self.entries.len(), self.total_size)?;
        for e in &self.entries {
            write!(f, "  {}  {}", e.path, e.size)?;
            if e.encrypted {
                f.write_str("  [encrypted]")?;
            }
            if e.truncated {
                f.write_str("  [truncated]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
