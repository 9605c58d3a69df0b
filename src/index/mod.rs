//! The container index: an ordered, path-keyed table of entries.
//!
//! On disk every path carries the `res://` prefix and is zero padded to a
//! multiple of four bytes. In memory the prefix is stripped, separators are
//! forward slashes and offsets are measured from the container start for
//! both revisions.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::crypto::DIGEST_LEN;
use crate::error::FormatError;
use crate::header::Revision;

pub const PATH_PREFIX: &str = "res://";
pub const MAX_PATH_LEN: u32 = 4096;
/// Revision 2 entry flag: the payload is stored as an encrypted block.
pub const PACK_FILE_ENCRYPTED: u32 = 1 << 0;

/// Smallest possible serialized entry, used to bound the entry count.
const MIN_ENTRY_LEN: u64 = 4 + 4 + 8 + 8 + DIGEST_LEN as u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PckEntry {
    pub path:      String,
    /// Payload start, relative to the container start.
    pub offset:    u64,
    /// Plaintext length.
    pub size:      u64,
    pub digest:    [u8; DIGEST_LEN],
    pub encrypted: bool,
    /// Set by the reader when the container ends before the payload does.
    pub truncated: bool,
}

impl PckEntry {
    /// Bytes the payload occupies on disk, including any encrypted block header.
    pub fn stored_len(&self) -> u64 {
        if self.encrypted {
            self.size.saturating_add(crate::crypto::BLOCK_HEADER_LEN)
        } else {
            self.size
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PckIndex {
    entries: Vec<PckEntry>,
    by_path: HashMap<String, usize>,
}

impl PckIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: PckEntry) -> Result<(), FormatError> {
        if self.by_path.contains_key(&entry.path) {
            return Err(FormatError::DuplicatePath(entry.path));
        }
        self.by_path.insert(entry.path.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&PckEntry> {
        self.by_path.get(path).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    /// Entries in file order.
    pub fn iter(&self) -> impl Iterator<Item = &PckEntry> {
        self.entries.iter()
    }

    /// Paths are keys, so only the writer's layout pass may touch entries.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PckEntry> {
        self.entries.iter_mut()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.path.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn truncated_entries(&self) -> impl Iterator<Item = &PckEntry> {
        self.entries.iter().filter(|e| e.truncated)
    }

    pub fn any_encrypted(&self) -> bool {
        self.entries.iter().any(|e| e.encrypted)
    }

    /// Serialized byte length; independent of offsets, so usable before layout.
    pub fn encoded_len(&self, revision: &Revision) -> u64 {
        4 + self.entries.iter().map(|e| entry_len(&e.path, revision)).sum::<u64>()
    }

    pub fn write<W: Write>(&self, mut writer: W, revision: &Revision) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            write_entry(&mut writer, entry, revision)?;
        }
        Ok(())
    }

    /// Parse a serialized index. `container_len` bounds offsets and the count.
    pub fn read<R: Read>(
        mut reader: R,
        revision: &Revision,
        container_len: u64,
        available: u64,
    ) -> Result<Self, IndexReadError> {
        let count = reader.read_u32::<LittleEndian>()?;
        if u64::from(count) * MIN_ENTRY_LEN > available {
            return Err(FormatError::EntryCount { count, available }.into());
        }
        let mut index = PckIndex::new();
        for _ in 0..count {
            let entry = read_entry(&mut reader, revision, container_len)?;
            index.insert(entry)?;
        }
        Ok(index)
    }
}

/// Index parsing fails either on I/O or on a structural violation; the
/// caller decides whether a violation means a wrong key.
#[derive(Debug)]
pub enum IndexReadError {
    Io(io::Error),
    Format(FormatError),
}

impl From<io::Error> for IndexReadError {
    fn from(e: io::Error) -> Self {
        IndexReadError::Io(e)
    }
}

impl From<FormatError> for IndexReadError {
    fn from(e: FormatError) -> Self {
        IndexReadError::Format(e)
    }
}

fn padded_path_len(path: &str) -> u32 {
    let raw = (PATH_PREFIX.len() + path.len()) as u32;
    (raw + 3) & !3
}

fn entry_len(path: &str, revision: &Revision) -> u64 {
    let flags = if revision.has_entry_flags() { 4 } else { 0 };
    4 + u64::from(padded_path_len(path)) + 8 + 8 + DIGEST_LEN as u64 + flags
}

fn write_entry<W: Write>(writer: &mut W, entry: &PckEntry, revision: &Revision) -> io::Result<()> {
    let padded = padded_path_len(&entry.path);
    let full = format!("{PATH_PREFIX}{}", entry.path);
    writer.write_u32::<LittleEndian>(padded)?;
    writer.write_all(full.as_bytes())?;
    writer.write_all(&[0u8; 3][..padded as usize - full.len()])?;
    let relative = entry.offset.checked_sub(revision.offset_base()).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{} lies before the file base", entry.path))
    })?;
    writer.write_u64::<LittleEndian>(relative)?;
    writer.write_u64::<LittleEndian>(entry.size)?;
    writer.write_all(&entry.digest)?;
    if revision.has_entry_flags() {
        let flags = if entry.encrypted { PACK_FILE_ENCRYPTED } else { 0 };
        writer.write_u32::<LittleEndian>(flags)?;
    }
    Ok(())
}

fn read_entry<R: Read>(
    reader: &mut R,
    revision: &Revision,
    container_len: u64,
) -> Result<PckEntry, IndexReadError> {
    let path_len = reader.read_u32::<LittleEndian>()?;
    if path_len == 0 || path_len > MAX_PATH_LEN {
        return Err(FormatError::PathLength(path_len).into());
    }
    let mut raw = vec![0u8; path_len as usize];
    reader.read_exact(&mut raw)?;
    while raw.last() == Some(&0) {
        raw.pop();
    }
    let full = String::from_utf8(raw).map_err(|_| FormatError::PathEncoding)?;
    let path = normalize_path(full.strip_prefix(PATH_PREFIX).unwrap_or(&full))?;

    let relative = reader.read_u64::<LittleEndian>()?;
    let size = reader.read_u64::<LittleEndian>()?;
    let mut digest = [0u8; DIGEST_LEN];
    reader.read_exact(&mut digest)?;
    let encrypted = if revision.has_entry_flags() {
        reader.read_u32::<LittleEndian>()? & PACK_FILE_ENCRYPTED != 0
    } else {
        false
    };

    let offset = relative
        .checked_add(revision.offset_base())
        .filter(|&o| o <= container_len)
        .ok_or_else(|| FormatError::EntryOutOfBounds {
            path:   path.clone(),
            offset: relative,
            len:    container_len,
        })?;

    let mut entry = PckEntry { path, offset, size, digest, encrypted, truncated: false };
    entry.truncated = offset
        .checked_add(entry.stored_len())
        .map_or(true, |end| end > container_len);
    Ok(entry)
}

/// Canonical relative form: forward slashes, no empty, `.` or `..` components.
pub fn normalize_path(path: &str) -> Result<String, FormatError> {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_start_matches('/');
    if trimmed.is_empty() || unified.contains(':') {
        return Err(FormatError::UnsafePath(path.to_string()));
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => continue,
            ".."     => return Err(FormatError::UnsafePath(path.to_string())),
            p        => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(FormatError::UnsafePath(path.to_string()));
    }
    Ok(parts.join("/"))
}
