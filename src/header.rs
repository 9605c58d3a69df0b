use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{FormatError, PckError};
use crate::version::PckVersion;

/// "GDPC" read as a little-endian u32.
pub const MAGIC: u32 = 0x4350_4447;
/// Byte offset of the four version fields within the header.
pub const VERSION_OFFSET: u64 = 4;
/// Byte length of the four version fields.
pub const VERSION_LEN: u64 = 16;
pub const RESERVED_WORDS: usize = 16;

/// Revision 2 pack flag: the index is stored as one encrypted block.
pub const PACK_DIR_ENCRYPTED: u32 = 1 << 0;

pub const HEADER_SIZE_V1: u64 = 4 + VERSION_LEN + 4 * RESERVED_WORDS as u64;
pub const HEADER_SIZE_V2: u64 = 4 + VERSION_LEN + 4 + 8 + 4 * RESERVED_WORDS as u64;

/// Structural revision of the container, decided once at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    One,
    Two { flags: u32, file_base: u64 },
}

impl Revision {
    pub fn number(&self) -> u32 {
        match self {
            Revision::One         => 1,
            Revision::Two { .. }  => 2,
        }
    }

    pub fn check(number: u32) -> Result<(), FormatError> {
        match number {
            1 | 2 => Ok(()),
            n     => Err(FormatError::UnsupportedRevision(n)),
        }
    }

    pub fn header_size(&self) -> u64 {
        match self {
            Revision::One        => HEADER_SIZE_V1,
            Revision::Two { .. } => HEADER_SIZE_V2,
        }
    }

    pub fn index_encrypted(&self) -> bool {
        matches!(self, Revision::Two { flags, .. } if flags & PACK_DIR_ENCRYPTED != 0)
    }

    /// Whether entries carry a per-entry flags word.
    pub fn has_entry_flags(&self) -> bool {
        matches!(self, Revision::Two { .. })
    }

    /// Base that on-disk entry offsets are relative to.
    pub fn offset_base(&self) -> u64 {
        match self {
            Revision::One                   => 0,
            Revision::Two { file_base, .. } => *file_base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PckHeader {
    pub version:  PckVersion,
    pub revision: Revision,
}

impl PckHeader {
    pub fn size(&self) -> u64 {
        self.revision.header_size()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(MAGIC)?;
        for field in self.version.fields() {
            writer.write_u32::<LittleEndian>(field)?;
        }
        if let Revision::Two { flags, file_base } = self.revision {
            writer.write_u32::<LittleEndian>(flags)?;
            writer.write_u64::<LittleEndian>(file_base)?;
        }
        writer.write_all(&[0u8; 4 * RESERVED_WORDS])?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, PckError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic(magic).into());
        }
        let format = reader.read_u32::<LittleEndian>()?;
        Revision::check(format)?;
        let version = PckVersion {
            format,
            major: reader.read_u32::<LittleEndian>()?,
            minor: reader.read_u32::<LittleEndian>()?,
            patch: reader.read_u32::<LittleEndian>()?,
        };
        let revision = if format == 1 {
            Revision::One
        } else {
            Revision::Two {
                flags:     reader.read_u32::<LittleEndian>()?,
                file_base: reader.read_u64::<LittleEndian>()?,
            }
        };
        let mut reserved = [0u8; 4 * RESERVED_WORDS];
        reader.read_exact(&mut reserved)?;
        Ok(Self { version, revision })
    }
}
