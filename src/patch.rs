//! In-place version rewrite.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::archive::PckTool;
use crate::error::{PckError, Result};
use crate::fs::{Fs, FsFile};
use crate::header::{VERSION_LEN, VERSION_OFFSET};
use crate::io_stream::PckReader;
use crate::version::PckVersion;

impl<F: Fs> PckTool<F> {
    /// Overwrite the version fields of the container at `path`, standalone or
    /// embedded.  Only the 16 version bytes change.  Returns the old version.
    pub fn change_version(&self, path: &Path, version: &str) -> Result<PckVersion> {
        let version: PckVersion = version.parse()?;
        let location = self.locate(path, true)?;
        let mut file = self.fs().open_rw(path).map_err(|e| PckError::io_at(path, e))?;
        let header = PckReader::new(&mut file, location.offset, location.len).read_header()?;
        if header.version.format != version.format {
            return Err(PckError::RevisionMismatch {
                container: header.version.format,
                requested: version.format,
            });
        }

        let mut fields = Vec::with_capacity(VERSION_LEN as usize);
        for field in version.fields() {
            fields.write_u32::<LittleEndian>(field)?;
        }
        file.seek(SeekFrom::Start(location.offset + VERSION_OFFSET))?;
        file.write_all(&fields)?;
        file.flush()?;
        file.sync_all()?;

        tracing::info!(
            path = %path.display(),
            from = %header.version,
            to = %version,
            "version changed"
        );
        Ok(header.version)
    }
}
