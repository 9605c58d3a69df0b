use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::version::VersionError;

/// Structural violations of the container layout.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic number: {0:#010x}")]
    BadMagic(u32),
    #[error("Unsupported format revision: {0}")]
    UnsupportedRevision(u32),
    #[error("Duplicate entry path: {0}")]
    DuplicatePath(String),
    #[error("Entry path length out of range: {0}")]
    PathLength(u32),
    #[error("Entry path is not valid UTF-8")]
    PathEncoding,
    #[error("Entry path escapes the output directory: {0}")]
    UnsafePath(String),
    #[error("Entry count {count} cannot fit in {available} bytes")]
    EntryCount { count: u32, available: u64 },
    #[error("Entry {path} starts at {offset}, past the container end ({len})")]
    EntryOutOfBounds { path: String, offset: u64, len: u64 },
    #[error("Entry {0} is truncated: the container ends before its payload does")]
    TruncatedEntry(String),
    #[error("Encrypted block declares {declared} bytes but only {available} remain")]
    BlockLength { declared: u64, available: u64 },
    #[error("Container is too short for its header ({0} bytes)")]
    TooShort(u64),
    #[error("Layout does not fit in 64-bit offsets")]
    LayoutOverflow,
}

#[derive(Error, Debug)]
pub enum PckError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("Invalid encryption key or corrupted data")]
    InvalidKeyOrCorrupt,
    #[error("Container is encrypted but no decryption key was provided")]
    MissingKey,
    #[error("Invalid version string: {0}")]
    InvalidVersionString(#[from] VersionError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} already contains an embedded container")]
    AlreadyEmbedded(PathBuf),
    #[error("{0} does not contain an embedded container")]
    NotEmbedded(PathBuf),
    #[error("Source and destination are the same file: {0}")]
    SameFileConflict(PathBuf),
    #[error("Backup already exists: {0}")]
    BackupExists(PathBuf),
    #[error("No files selected")]
    EmptySelection,
    #[error("Container revision is {container}, requested version targets revision {requested}")]
    RevisionMismatch { container: u32, requested: u32 },
    #[error("Format revision {0} does not support encryption")]
    EncryptionUnsupported(u32),
}

pub type Result<T> = std::result::Result<T, PckError>;

impl PckError {
    /// Build an `Io` error carrying the offending path in its message.
    pub(crate) fn io_at(path: &std::path::Path, err: io::Error) -> Self {
        PckError::Io(io::Error::new(err.kind(), format!("{}: {err}", path.display())))
    }
}
