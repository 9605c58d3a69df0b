//! Packing sources into containers and extracting entries back to disk.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::archive::{Location, PckTool};
use crate::crypto::EncryptionKey;
use crate::discover::{discover, hash_all, DiscoveredFile};
use crate::embed::{backup_path, EmbedState, MergeReport};
use crate::error::{FormatError, PckError, Result};
use crate::fs::{parent_dir, Fs, TempFile};
use crate::index::{normalize_path, PckEntry};
use crate::io_stream::{PckWriter, PendingFile, WriteOptions, DEFAULT_PAYLOAD_ALIGNMENT};
use crate::version::PckVersion;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum PackSource {
    /// Every regular file below a directory.
    Directory(PathBuf),
    /// An explicit selection, usually a subset of a discovery.
    Files(Vec<DiscoveredFile>),
}

/// Configuration for [`PckTool::pack`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub encrypt_index: bool,
    pub encrypt_files: bool,
    pub key:           Option<EncryptionKey>,
    /// Splice into the existing executable at the destination instead of
    /// writing a standalone container.
    pub embed:         bool,
    /// With `embed`, rename the executable to its `.old` backup first.
    pub keep_backup:   bool,
    pub alignment:     u64,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            encrypt_index: false,
            encrypt_files: false,
            key:           None,
            embed:         false,
            keep_backup:   true,
            alignment:     DEFAULT_PAYLOAD_ALIGNMENT,
        }
    }
}

impl PackOptions {
    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            encrypt_index: self.encrypt_index,
            encrypt_files: self.encrypt_files,
            key:           self.key.clone(),
            alignment:     self.alignment,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackReport {
    pub destination:   PathBuf,
    pub version:       PckVersion,
    pub entries:       usize,
    pub container_len: u64,
    /// Set when the container was spliced into an executable.
    pub merge:         Option<MergeReport>,
}

/// Configuration for [`PckTool::extract`].
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Rewrite files that already exist.  When false, an existing file with
    /// the entry's size is left alone.
    pub overwrite: bool,
    /// Container paths to extract; `None` extracts everything.
    pub filter:    Option<Vec<String>>,
    pub key:       Option<EncryptionKey>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { overwrite: true, filter: None, key: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub written: Vec<String>,
    pub skipped: Vec<String>,
}

// ── Pack ──────────────────────────────────────────────────────────────────────

impl<F: Fs> PckTool<F> {
    /// Build a container from `source` at `destination`.
    pub fn pack(
        &self,
        source:      &PackSource,
        destination: &Path,
        version:     &str,
        options:     &PackOptions,
    ) -> Result<PackReport> {
        let version: PckVersion = version.parse()?;
        let write_options = options.write_options();
        write_options.validate(&version)?;

        let files = match source {
            PackSource::Directory(root) => discover(root)?,
            PackSource::Files(list) => list
                .iter()
                .map(|f| {
                    if !self.fs().exists(&f.source) {
                        return Err(PckError::io_at(&f.source, std::io::ErrorKind::NotFound.into()));
                    }
                    Ok(DiscoveredFile { path: normalize_path(&f.path)?, ..f.clone() })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        if files.is_empty() {
            return Err(PckError::EmptySelection);
        }
        let mut seen = HashSet::new();
        for f in &files {
            if !seen.insert(f.path.as_str()) {
                return Err(FormatError::DuplicatePath(f.path.clone()).into());
            }
        }
        if options.embed && options.keep_backup {
            let backup = backup_path(destination);
            if self.fs().exists(&backup) {
                return Err(PckError::BackupExists(backup));
            }
        }
        self.fs().check_writable(destination).map_err(|e| PckError::io_at(destination, e))?;

        let pending = hash_all(&files)?;
        let sources: HashMap<&str, &Path> =
            files.iter().map(|f| (f.path.as_str(), f.source.as_path())).collect();

        let report = if options.embed {
            let state = EmbedState::probe(self.fs(), destination)?;
            let mut temp = TempFile::new(self.fs(), destination)?;
            let container_len = self.write_container(&mut temp, &pending, &sources, version, write_options)?;
            if let EmbedState::Embedded(old) = state {
                tracing::info!(
                    host = %destination.display(),
                    old_len = old.container_len,
                    "replacing embedded container"
                );
            }
            let plan = state.begin_replace(container_len, version.format)?;
            let location = Location {
                path:     temp.path().to_path_buf(),
                embedded: false,
                offset:   0,
                len:      container_len,
            };
            let merge = self.splice(destination, &plan, &location, options.keep_backup)?;
            PackReport {
                destination: destination.to_path_buf(),
                version,
                entries: pending.len(),
                container_len,
                merge: Some(merge),
            }
        } else {
            self.fs()
                .create_dir_all(parent_dir(destination))
                .map_err(|e| PckError::io_at(destination, e))?;
            let mut temp = TempFile::new(self.fs(), destination)?;
            let container_len = self.write_container(&mut temp, &pending, &sources, version, write_options)?;
            temp.commit(destination).map_err(|e| PckError::io_at(destination, e))?;
            PackReport {
                destination: destination.to_path_buf(),
                version,
                entries: pending.len(),
                container_len,
                merge: None,
            }
        };

        tracing::info!(
            destination = %destination.display(),
            version = %version,
            entries = report.entries,
            bytes = report.container_len,
            embedded = options.embed,
            "container packed"
        );
        Ok(report)
    }

    fn write_container(
        &self,
        temp:    &mut TempFile<'_, F>,
        pending: &[PendingFile],
        sources: &HashMap<&str, &Path>,
        version: PckVersion,
        options: WriteOptions,
    ) -> Result<u64> {
        let file = temp.file()?;
        PckWriter::new(BufWriter::new(&mut *file), version, options)?.write(pending, |p| {
            let source = sources.get(p.path.as_str()).copied().unwrap_or_else(|| Path::new(""));
            File::open(source).map(BufReader::new)
        })?;
        Ok(file.seek(SeekFrom::End(0))?)
    }

    // ── Extract ───────────────────────────────────────────────────────────────

    /// Write the selected entries of `container` below `out_dir`.
    pub fn extract(&self, container: &Path, out_dir: &Path, options: &ExtractOptions) -> Result<ExtractReport> {
        let location = self.locate(container, true)?;
        let mut reader = self.reader(&location)?;
        let (_, index) = reader.read_index(options.key.as_ref())?;

        let selected: Vec<&PckEntry> = match &options.filter {
            None => index.iter().collect(),
            Some(filter) => {
                let wanted: HashSet<String> =
                    filter.iter().filter_map(|p| normalize_path(p).ok()).collect();
                index.iter().filter(|e| wanted.contains(&e.path)).collect()
            }
        };
        if selected.is_empty() {
            return Err(PckError::EmptySelection);
        }
        if options.key.is_none() && selected.iter().any(|e| e.encrypted) {
            return Err(PckError::MissingKey);
        }

        let fs = self.fs();
        fs.create_dir_all(out_dir).map_err(|e| PckError::io_at(out_dir, e))?;
        let mut report = ExtractReport::default();
        for entry in selected {
            let dest = out_dir.join(&entry.path);
            if entry.truncated {
                tracing::warn!(path = %entry.path, "skipping truncated entry");
                report.skipped.push(entry.path.clone());
                continue;
            }
            if !options.overwrite && fs.exists(&dest) && fs.len(&dest).ok() == Some(entry.size) {
                tracing::debug!(path = %entry.path, "keeping existing file");
                report.skipped.push(entry.path.clone());
                continue;
            }
            fs.create_dir_all(parent_dir(&dest)).map_err(|e| PckError::io_at(&dest, e))?;
            let mut temp = TempFile::new(fs, &dest)?;
            {
                let mut out = BufWriter::new(temp.file()?);
                reader.copy_entry(entry, options.key.as_ref(), &mut out)?;
                out.flush()?;
            }
            temp.commit(&dest).map_err(|e| PckError::io_at(&dest, e))?;
            report.written.push(entry.path.clone());
        }

        tracing::info!(
            container = %container.display(),
            out_dir = %out_dir.display(),
            written = report.written.len(),
            skipped = report.skipped.len(),
            "container extracted"
        );
        Ok(report)
    }
}
