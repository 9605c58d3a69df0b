//! Streaming container engine: writer and reader.
//!
//! # Writer
//! [`PckWriter`] lays the container out in two passes.  The first pass fixes
//! the header and index size, which pins the payload start, then assigns
//! aligned offsets monotonically.  The second pass writes header, index
//! (optionally sealed as one encrypted block) and streams every payload from
//! its source, encrypting per file when asked.  Offsets in the written index
//! are the final on-disk positions; nothing is patched afterwards, so the
//! writer only needs `Write`.
//!
//! # Reader
//! [`PckReader`] views a `[base, base + len)` window of a seekable source, so
//! the same code reads a standalone container and one embedded in a host.
//! It owns its source only for the duration of one operation.
//!
//! # Endianness
//! All binary I/O is little-endian; see `header.rs` and `index/mod.rs` for
//! field-level layout.

use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};

use crate::crypto::{
    self, derive_iv, DigestWriter, EncryptedBlockHeader, EncryptionKey, KeyStream,
    BLOCK_HEADER_LEN, DIGEST_LEN, INDEX_STREAM,
};
use crate::error::{FormatError, PckError, Result};
use crate::header::{PckHeader, Revision, HEADER_SIZE_V1, PACK_DIR_ENCRYPTED};
use crate::index::{IndexReadError, PckEntry, PckIndex};
use crate::version::PckVersion;

/// Default alignment of every payload start.
pub const DEFAULT_PAYLOAD_ALIGNMENT: u64 = 16;
const COPY_CHUNK: usize = 64 * 1024;

/// Round `value` up to a multiple of `alignment`; `None` past `u64::MAX`.
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(value);
    }
    value.div_ceil(alignment).checked_mul(alignment)
}

/// Copy exactly `len` bytes, optionally running them through a keystream and
/// then a digest.
pub(crate) fn pump<R: Read, W: Write>(
    src:           &mut R,
    dst:           &mut W,
    len:           u64,
    mut keystream: Option<&mut KeyStream>,
    mut digest:    Option<&mut DigestWriter>,
) -> io::Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK.min(len as usize).max(1)];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = match src.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended {remaining} bytes early"),
                ))
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let chunk = &mut buf[..n];
        if let Some(ks) = keystream.as_deref_mut() {
            ks.apply(chunk);
        }
        if let Some(d) = digest.as_deref_mut() {
            d.update(chunk);
        }
        dst.write_all(chunk)?;
        remaining -= n as u64;
    }
    Ok(())
}

// ── Writer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub encrypt_index: bool,
    pub encrypt_files: bool,
    pub key:           Option<EncryptionKey>,
    pub alignment:     u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            encrypt_index: false,
            encrypt_files: false,
            key:           None,
            alignment:     DEFAULT_PAYLOAD_ALIGNMENT,
        }
    }
}

impl WriteOptions {
    /// Reject encryption requests the target revision or the key cannot honour.
    pub fn validate(&self, version: &PckVersion) -> Result<()> {
        if self.encrypt_index || self.encrypt_files {
            if self.key.is_none() {
                return Err(PckError::MissingKey);
            }
            if version.format < 2 {
                return Err(PckError::EncryptionUnsupported(version.format));
            }
        }
        Ok(())
    }
}

/// A file queued for writing.  Size and digest come from a hashing pass over
/// the source, so the index can be laid out before any payload is copied.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub path:   String,
    pub size:   u64,
    pub digest: [u8; DIGEST_LEN],
}

pub struct PckWriter<W: Write> {
    writer:   W,
    position: u64,
    version:  PckVersion,
    options:  WriteOptions,
}

impl<W: Write> PckWriter<W> {
    pub fn new(writer: W, version: PckVersion, options: WriteOptions) -> Result<Self> {
        options.validate(&version)?;
        Ok(Self { writer, position: 0, version, options })
    }

    /// First pass: header and index size fix the payload start; payload
    /// offsets follow in file order.
    pub fn layout(&self, files: &[PendingFile]) -> Result<(PckHeader, PckIndex)> {
        let mut index = PckIndex::new();
        for file in files {
            index.insert(PckEntry {
                path:      file.path.clone(),
                offset:    0,
                size:      file.size,
                digest:    file.digest,
                encrypted: self.options.encrypt_files,
                truncated: false,
            })?;
        }

        let alignment = self.options.alignment;
        let (header_size, provisional) = if self.version.format == 1 {
            (HEADER_SIZE_V1, Revision::One)
        } else {
            let revision = Revision::Two { flags: 0, file_base: 0 };
            (revision.header_size(), revision)
        };
        let mut index_len = index.encoded_len(&provisional);
        if self.options.encrypt_index {
            index_len += BLOCK_HEADER_LEN;
        }
        let payload_start = align_up(header_size + index_len, alignment).ok_or(FormatError::LayoutOverflow)?;

        let revision = match provisional {
            Revision::One => Revision::One,
            Revision::Two { .. } => Revision::Two {
                flags:     if self.options.encrypt_index { PACK_DIR_ENCRYPTED } else { 0 },
                file_base: payload_start,
            },
        };

        let mut cursor = payload_start;
        for entry in index.iter_mut() {
            entry.offset = cursor;
            cursor = cursor
                .checked_add(entry.stored_len())
                .and_then(|end| align_up(end, alignment))
                .ok_or(FormatError::LayoutOverflow)?;
        }
        tracing::debug!(
            files = files.len(),
            payload_start,
            index_len,
            "laid out container"
        );
        Ok((PckHeader { version: self.version, revision }, index))
    }

    /// Second pass: write everything.  `open` yields each file's plaintext.
    pub fn write<S, R>(mut self, files: &[PendingFile], mut open: S) -> Result<(PckHeader, PckIndex)>
    where
        S: FnMut(&PendingFile) -> io::Result<R>,
        R: Read,
    {
        let (header, index) = self.layout(files)?;

        let mut head = Vec::with_capacity(header.size() as usize);
        header.write(&mut head)?;
        let mut table = Vec::with_capacity(index.encoded_len(&header.revision) as usize);
        index.write(&mut table, &header.revision)?;
        if self.options.encrypt_index {
            let key = self.options.key.as_ref().ok_or(PckError::MissingKey)?;
            table = crypto::seal(key, INDEX_STREAM, &table);
        }
        self.emit(&head)?;
        self.emit(&table)?;

        for (file, entry) in files.iter().zip(index.iter()) {
            self.pad_to(entry.offset)?;
            let mut source = open(file)?;
            if entry.encrypted {
                let key = self.options.key.as_ref().ok_or(PckError::MissingKey)?;
                let block = EncryptedBlockHeader {
                    digest: entry.digest,
                    length: entry.size,
                    iv:     derive_iv(entry.path.as_bytes()),
                };
                block.write(&mut self.writer)?;
                let mut keystream = KeyStream::new(key, &block.iv);
                pump(&mut source, &mut self.writer, entry.size, Some(&mut keystream), None)?;
            } else {
                pump(&mut source, &mut self.writer, entry.size, None, None)?;
            }
            self.position += entry.stored_len();
        }
        self.writer.flush()?;
        tracing::debug!(bytes = self.position, entries = index.len(), "container written");
        Ok((header, index))
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn pad_to(&mut self, offset: u64) -> io::Result<()> {
        let gap = offset.saturating_sub(self.position) as usize;
        if gap > 0 {
            self.emit(&vec![0u8; gap])?;
        }
        Ok(())
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct PckReader<R: Read + Seek> {
    reader: R,
    base:   u64,
    len:    u64,
}

impl<R: Read + Seek> PckReader<R> {
    /// View the container occupying `[base, base + len)` of `reader`.
    pub fn new(reader: R, base: u64, len: u64) -> Self {
        Self { reader, base, len }
    }

    pub fn container_len(&self) -> u64 {
        self.len
    }

    pub fn read_header(&mut self) -> Result<PckHeader> {
        if self.len < HEADER_SIZE_V1 {
            return Err(FormatError::TooShort(self.len).into());
        }
        self.reader.seek(SeekFrom::Start(self.base))?;
        let header = PckHeader::read(BufReader::new(&mut self.reader))?;
        if header.size() > self.len {
            return Err(FormatError::TooShort(self.len).into());
        }
        Ok(header)
    }

    /// Read header and index, decrypting the index when the header says so.
    pub fn read_index(&mut self, key: Option<&EncryptionKey>) -> Result<(PckHeader, PckIndex)> {
        let header = self.read_header()?;
        let revision = header.revision;
        let available = self.len - header.size();
        self.reader.seek(SeekFrom::Start(self.base + header.size()))?;
        let mut input = BufReader::new(&mut self.reader);

        let index = if revision.index_encrypted() {
            let key = key.ok_or(PckError::MissingKey)?;
            let block = EncryptedBlockHeader::read(&mut input)?;
            let room = available.saturating_sub(BLOCK_HEADER_LEN);
            if block.length > room {
                return Err(FormatError::BlockLength { declared: block.length, available: room }.into());
            }
            let mut table = vec![0u8; block.length as usize];
            input.read_exact(&mut table)?;
            if !crypto::open_in_place(key, &block, &mut table) {
                return Err(PckError::InvalidKeyOrCorrupt);
            }
            PckIndex::read(Cursor::new(&table), &revision, self.len, block.length)
                .map_err(|_| PckError::InvalidKeyOrCorrupt)?
        } else {
            PckIndex::read(&mut input, &revision, self.len, available).map_err(|e| match e {
                IndexReadError::Io(e)     => PckError::Io(e),
                IndexReadError::Format(e) => PckError::Format(e),
            })?
        };

        for entry in index.truncated_entries() {
            tracing::warn!(path = %entry.path, "entry extends past the end of the container");
        }
        Ok((header, index))
    }

    /// Stream one entry's plaintext into `out`.  Encrypted payloads are
    /// decrypted with their own keystream and checked against their digest;
    /// on failure `out` holds garbage and must be discarded by the caller.
    pub fn copy_entry<W: Write>(
        &mut self,
        entry: &PckEntry,
        key:   Option<&EncryptionKey>,
        out:   &mut W,
    ) -> Result<()> {
        if entry.truncated {
            return Err(FormatError::TruncatedEntry(entry.path.clone()).into());
        }
        self.reader.seek(SeekFrom::Start(self.base + entry.offset))?;
        let mut input = BufReader::new(&mut self.reader);
        if !entry.encrypted {
            pump(&mut input, out, entry.size, None, None)?;
            return Ok(());
        }

        let key = key.ok_or(PckError::MissingKey)?;
        let block = EncryptedBlockHeader::read(&mut input)?;
        if block.length != entry.size {
            return Err(PckError::InvalidKeyOrCorrupt);
        }
        let mut keystream = KeyStream::new(key, &block.iv);
        let mut digest = DigestWriter::new();
        pump(&mut input, out, entry.size, Some(&mut keystream), Some(&mut digest))?;
        if digest.finalize() != block.digest {
            return Err(PckError::InvalidKeyOrCorrupt);
        }
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
