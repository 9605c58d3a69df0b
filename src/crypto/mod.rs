//! AES-256-CTR stream transform for encrypted indexes and payloads.
//!
//! Key:        32 raw bytes, supplied as a 64-character hex string
//! Keystream:  AES-256, 128-bit big-endian counter, IV stored per stream
//! IV:         BLAKE3 `derive_key(IV_CONTEXT, label)` truncated to 16 bytes
//!
//! Encrypted block layout: [ digest (16 B) | length (u64) | iv (16 B) | ciphertext ]
//!
//! Counter mode needs no padding, so ciphertext length equals plaintext length.
//! Each stream restarts its own counter, so one file can be decrypted without
//! touching its siblings.

use aes::Aes256;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use thiserror::Error;

pub const KEY_LEN:    usize = 32;
pub const IV_LEN:     usize = 16;
pub const DIGEST_LEN: usize = 16;
/// Byte length of [`EncryptedBlockHeader`] on disk.
pub const BLOCK_HEADER_LEN: u64 = (DIGEST_LEN + 8 + IV_LEN) as u64;

const IV_CONTEXT: &str = "pckforge 2024-03-01 per-stream initialization vector";

/// IV label used for the index stream.
pub const INDEX_STREAM: &[u8] = b"index";

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key: not a hex string")]
    InvalidKeyHex,
    #[error("Invalid key: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// 256-bit key. `Debug` never shows the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl FromStr for EncryptionKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKeyHex)?;
        let bytes: [u8; KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(raw.len()))?;
        Ok(Self(bytes))
    }
}

/// Derive the IV for the stream identified by `label`.
pub fn derive_iv(label: &[u8]) -> [u8; IV_LEN] {
    let full = blake3::derive_key(IV_CONTEXT, label);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&full[..IV_LEN]);
    iv
}

/// 16-byte content digest (BLAKE3 prefix).
pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    truncate_hash(blake3::hash(data))
}

fn truncate_hash(hash: blake3::Hash) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hash.as_bytes()[..DIGEST_LEN]);
    out
}

/// Streaming digest sink; feed it with `io::copy`.
#[derive(Default)]
pub struct DigestWriter {
    hasher: blake3::Hasher,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> [u8; DIGEST_LEN] {
        truncate_hash(self.hasher.finalize())
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Counter-mode keystream. The same call encrypts and decrypts.
pub struct KeyStream {
    cipher: Aes256Ctr,
}

impl KeyStream {
    pub fn new(key: &EncryptionKey, iv: &[u8; IV_LEN]) -> Self {
        Self {
            cipher: Aes256Ctr::new(GenericArray::from_slice(&key.0), GenericArray::from_slice(iv)),
        }
    }

    /// XOR the next `buf.len()` keystream bytes into `buf`.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedBlockHeader {
    pub digest: [u8; DIGEST_LEN],
    pub length: u64,
    pub iv:     [u8; IV_LEN],
}

impl EncryptedBlockHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.digest)?;
        writer.write_u64::<LittleEndian>(self.length)?;
        writer.write_all(&self.iv)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut digest = [0u8; DIGEST_LEN];
        reader.read_exact(&mut digest)?;
        let length = reader.read_u64::<LittleEndian>()?;
        let mut iv = [0u8; IV_LEN];
        reader.read_exact(&mut iv)?;
        Ok(Self { digest, length, iv })
    }
}

/// Encrypt `plaintext` as a complete in-memory block (header + ciphertext).
pub fn seal(key: &EncryptionKey, label: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let header = EncryptedBlockHeader {
        digest: digest(plaintext),
        length: plaintext.len() as u64,
        iv:     derive_iv(label),
    };
    let mut out = Vec::with_capacity(BLOCK_HEADER_LEN as usize + plaintext.len());
    // Writing into a Vec cannot fail.
    let _ = header.write(&mut out);
    let start = out.len();
    out.extend_from_slice(plaintext);
    KeyStream::new(key, &header.iv).apply(&mut out[start..]);
    out
}

/// Decrypt `ciphertext` in place and report whether the digest matches.
pub fn open_in_place(key: &EncryptionKey, header: &EncryptedBlockHeader, ciphertext: &mut [u8]) -> bool {
    KeyStream::new(key, &header.iv).apply(ciphertext);
    digest(ciphertext) == header.digest
}
