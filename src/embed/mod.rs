//! Splicing containers into and out of host executables.
//!
//! A merged host looks like
//!
//! ```text
//! | host bytes | pad to 8 | container | pad to 8 | footer (28 B) |
//! ```
//!
//! and the footer records everything needed to undo the merge exactly:
//!
//! | Field            | Size | Meaning                                   |
//! |------------------|------|-------------------------------------------|
//! | host_len         | 8    | host length before the merge              |
//! | container_offset | 8    | absolute start of the container, 8-aligned |
//! | container_len    | 8    | authoritative container length            |
//! | magic            | 4    | `GDPC`                                    |
//!
//! Every splice is planned through [`EmbedState`] before a byte is written:
//! `NotEmbedded → Embedding → Embedded` for merges and
//! `Embedded → Ripping → NotEmbedded` for rips and splits.  New files are
//! always produced as temp files beside their destination and renamed into
//! place, and a host is only truncated through a handle opened read-write up
//! front, so a locked destination fails the call before anything changes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::archive::{Location, PckTool};
use crate::error::{FormatError, PckError, Result};
use crate::fs::{parent_dir, Fs, FsFile, TempFile};
use crate::header::MAGIC;
use crate::io_stream::{align_up, pump};

pub const FOOTER_LEN: u64 = 28;
pub const EMBED_ALIGNMENT: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub host_len:         u64,
    pub container_offset: u64,
    pub container_len:    u64,
}

impl Footer {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.host_len)?;
        writer.write_u64::<LittleEndian>(self.container_offset)?;
        writer.write_u64::<LittleEndian>(self.container_len)?;
        writer.write_u32::<LittleEndian>(MAGIC)?;
        Ok(())
    }

    /// Parse the last [`FOOTER_LEN`] bytes of a file of `file_len` bytes.
    /// Returns `None` unless the footer describes exactly this file's layout.
    pub fn parse(tail: &[u8], file_len: u64) -> Option<Self> {
        if tail.len() as u64 != FOOTER_LEN || file_len < FOOTER_LEN {
            return None;
        }
        let mut cursor = Cursor::new(tail);
        let footer = Footer {
            host_len:         cursor.read_u64::<LittleEndian>().ok()?,
            container_offset: cursor.read_u64::<LittleEndian>().ok()?,
            container_len:    cursor.read_u64::<LittleEndian>().ok()?,
        };
        if cursor.read_u32::<LittleEndian>().ok()? != MAGIC {
            return None;
        }
        let consistent = align_up(footer.host_len, EMBED_ALIGNMENT) == Some(footer.container_offset)
            && footer
                .container_offset
                .checked_add(footer.container_len)
                .and_then(|end| align_up(end, EMBED_ALIGNMENT))
                .and_then(|end| end.checked_add(FOOTER_LEN))
                == Some(file_len);
        consistent.then_some(footer)
    }
}

/// How the merged layout relates to the 8-byte alignment engines expect.
///
/// Revision 1 engines load containers spliced after a misaligned host or of a
/// misaligned length; revision 2 engines have been seen to behave
/// inconsistently, so those merges are accepted but flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentVerdict {
    Aligned,
    Tolerated,
    Suspect,
}

impl AlignmentVerdict {
    pub fn assess(revision: u32, host_len: u64, container_len: u64) -> Self {
        if host_len % EMBED_ALIGNMENT == 0 && container_len % EMBED_ALIGNMENT == 0 {
            AlignmentVerdict::Aligned
        } else if revision < 2 {
            AlignmentVerdict::Tolerated
        } else {
            AlignmentVerdict::Suspect
        }
    }
}

/// Byte-level plan for appending a container to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePlan {
    pub footer:   Footer,
    pub verdict:  AlignmentVerdict,
    tail_padding: u64,
}

impl MergePlan {
    fn new(host_len: u64, container_len: u64, revision: u32) -> Result<Self> {
        let container_offset = align_up(host_len, EMBED_ALIGNMENT).ok_or(FormatError::LayoutOverflow)?;
        let end = container_offset.checked_add(container_len).ok_or(FormatError::LayoutOverflow)?;
        let padded_end = align_up(end, EMBED_ALIGNMENT)
            .filter(|padded| padded.checked_add(FOOTER_LEN).is_some())
            .ok_or(FormatError::LayoutOverflow)?;
        Ok(Self {
            footer: Footer { host_len, container_offset, container_len },
            verdict: AlignmentVerdict::assess(revision, host_len, container_len),
            tail_padding: padded_end - end,
        })
    }

    pub fn padding(&self) -> u64 {
        self.footer.container_offset - self.footer.host_len
    }

    pub fn tail_padding(&self) -> u64 {
        self.tail_padding
    }

    /// Length of the merged file.
    pub fn total_len(&self) -> u64 {
        self.footer.container_offset + self.footer.container_len + self.tail_padding + FOOTER_LEN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedState {
    NotEmbedded { host_len: u64 },
    Embedded(Footer),
}

impl EmbedState {
    /// Inspect the tail of `path`.
    pub fn probe<F: Fs>(fs: &F, path: &Path) -> Result<Self> {
        let mut file = fs.open(path).map_err(|e| PckError::io_at(path, e))?;
        Self::probe_file(&mut file)
    }

    pub(crate) fn probe_file<R: Read + Seek>(file: &mut R) -> Result<Self> {
        let file_len = file.seek(SeekFrom::End(0))?;
        if file_len < FOOTER_LEN {
            return Ok(EmbedState::NotEmbedded { host_len: file_len });
        }
        let mut tail = [0u8; FOOTER_LEN as usize];
        file.seek(SeekFrom::Start(file_len - FOOTER_LEN))?;
        file.read_exact(&mut tail)?;
        Ok(match Footer::parse(&tail, file_len) {
            Some(footer) => EmbedState::Embedded(footer),
            None         => EmbedState::NotEmbedded { host_len: file_len },
        })
    }

    /// `NotEmbedded → Embedding`.
    pub fn begin_merge(&self, host: &Path, container_len: u64, revision: u32) -> Result<MergePlan> {
        match *self {
            EmbedState::NotEmbedded { host_len } => MergePlan::new(host_len, container_len, revision),
            EmbedState::Embedded(_) => Err(PckError::AlreadyEmbedded(host.to_path_buf())),
        }
    }

    /// `Any → Embedding`, discarding a previously embedded container.
    pub fn begin_replace(&self, container_len: u64, revision: u32) -> Result<MergePlan> {
        MergePlan::new(self.original_len(), container_len, revision)
    }

    /// `Embedded → Ripping`.
    pub fn begin_rip(&self, host: &Path) -> Result<Footer> {
        match *self {
            EmbedState::Embedded(footer) => Ok(footer),
            EmbedState::NotEmbedded { .. } => Err(PckError::NotEmbedded(host.to_path_buf())),
        }
    }

    /// Length of the host without any embedded container.
    pub fn original_len(&self) -> u64 {
        match *self {
            EmbedState::NotEmbedded { host_len } => host_len,
            EmbedState::Embedded(footer)         => footer.host_len,
        }
    }
}

/// `game.exe` → `game.old.exe`, `game` → `game.old`.
pub fn backup_path(host: &Path) -> PathBuf {
    let stem = host.file_stem().unwrap_or_default().to_string_lossy();
    let name = match host.extension() {
        Some(ext) => format!("{stem}.old.{}", ext.to_string_lossy()),
        None      => format!("{stem}.old"),
    };
    host.with_file_name(name)
}

/// `game.exe` → `game.pck`.
pub fn sibling_container_path(host: &Path) -> PathBuf {
    host.with_extension("pck")
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub host:             PathBuf,
    pub backup:           Option<PathBuf>,
    pub container_offset: u64,
    pub container_len:    u64,
    pub padding:          u64,
    pub verdict:          AlignmentVerdict,
}

#[derive(Debug, Clone)]
pub struct RipReport {
    pub output:         PathBuf,
    pub container_len:  u64,
    pub host_len:       u64,
    pub backup_removed: bool,
}

#[derive(Debug, Clone)]
pub struct SplitReport {
    pub executable:    PathBuf,
    pub container:     PathBuf,
    pub container_len: u64,
}

impl<F: Fs> PckTool<F> {
    /// Append the container at `container` to `host`.
    pub fn merge(&self, container: &Path, host: &Path, keep_backup: bool) -> Result<MergeReport> {
        if self.fs().same_file(container, host) {
            return Err(PckError::SameFileConflict(host.to_path_buf()));
        }
        let source = self.locate(container, true)?;
        let header = self.read_header(&source)?;
        let state = EmbedState::probe(self.fs(), host)?;
        let plan = state.begin_merge(host, source.len, header.version.format)?;
        self.splice(host, &plan, &source, keep_backup)
    }

    /// Write `host` with the planned container appended, via a temp file.
    /// The original is renamed to its backup path first when `keep_backup`.
    pub(crate) fn splice(
        &self,
        host:        &Path,
        plan:        &MergePlan,
        source:      &Location,
        keep_backup: bool,
    ) -> Result<MergeReport> {
        let fs = self.fs();
        let backup = keep_backup.then(|| backup_path(host));
        if let Some(b) = &backup {
            if fs.exists(b) {
                return Err(PckError::BackupExists(b.clone()));
            }
        }
        fs.check_writable(host).map_err(|e| PckError::io_at(host, e))?;
        let mut src = fs.open(&source.path).map_err(|e| PckError::io_at(&source.path, e))?;
        let mut original = fs.open(host).map_err(|e| PckError::io_at(host, e))?;

        let mut temp = TempFile::new(fs, host)?;
        {
            let out = temp.file()?;
            original.seek(SeekFrom::Start(0))?;
            pump(&mut original, out, plan.footer.host_len, None, None)?;
            out.write_all(&vec![0u8; plan.padding() as usize])?;
            src.seek(SeekFrom::Start(source.offset))?;
            pump(&mut src, out, plan.footer.container_len, None, None)?;
            out.write_all(&vec![0u8; plan.tail_padding() as usize])?;
            plan.footer.write(&mut *out)?;
        }
        drop(original);
        fs.copy_permissions(host, temp.path())?;

        if let Some(b) = &backup {
            fs.rename(host, b).map_err(|e| PckError::io_at(b, e))?;
        }
        if let Err(e) = temp.commit(host) {
            if let Some(b) = &backup {
                if let Err(restore) = fs.rename(b, host) {
                    tracing::error!(host = %host.display(), error = %restore, "could not restore host from backup");
                }
            }
            return Err(PckError::io_at(host, e));
        }

        match plan.verdict {
            AlignmentVerdict::Aligned   => {}
            AlignmentVerdict::Tolerated => tracing::info!(
                host = %host.display(),
                "merged a misaligned container; revision 1 engines accept this"
            ),
            AlignmentVerdict::Suspect   => tracing::warn!(
                host = %host.display(),
                host_len = plan.footer.host_len,
                container_len = plan.footer.container_len,
                "merged a misaligned container; revision 2 engines may reject it"
            ),
        }
        tracing::info!(
            host = %host.display(),
            offset = plan.footer.container_offset,
            len = plan.footer.container_len,
            "container merged"
        );
        Ok(MergeReport {
            host:             host.to_path_buf(),
            backup,
            container_offset: plan.footer.container_offset,
            container_len:    plan.footer.container_len,
            padding:          plan.padding(),
            verdict:          plan.verdict,
        })
    }

    /// Copy the embedded container out of `host` and truncate the host back
    /// to its pre-merge length.  `output` defaults to `<host stem>.pck`.
    pub fn rip(&self, host: &Path, output: Option<&Path>, delete_backup: bool) -> Result<RipReport> {
        let fs = self.fs();
        let output = output.map(Path::to_path_buf).unwrap_or_else(|| sibling_container_path(host));
        if fs.same_file(host, &output) {
            return Err(PckError::SameFileConflict(output));
        }
        let footer = EmbedState::probe(fs, host)?.begin_rip(host)?;

        let mut host_file = fs.open_rw(host).map_err(|e| PckError::io_at(host, e))?;
        fs.check_writable(&output).map_err(|e| PckError::io_at(&output, e))?;
        self.extract_region(&mut host_file, &footer, &output)?.commit(&output)
            .map_err(|e| PckError::io_at(&output, e))?;
        host_file.set_len(footer.host_len)?;
        host_file.sync_all()?;
        drop(host_file);

        let backup_removed = delete_backup && self.remove_backup(host)?;
        tracing::info!(
            host = %host.display(),
            output = %output.display(),
            len = footer.container_len,
            "container ripped"
        );
        Ok(RipReport {
            output,
            container_len: footer.container_len,
            host_len:      footer.host_len,
            backup_removed,
        })
    }

    /// Split `host` into an executable and a sibling `.pck`.  With
    /// `new_host`, both are written under the new name and `host` is left as
    /// it was; otherwise `host` is truncated in place.  Never keeps a backup.
    pub fn split(&self, host: &Path, new_host: Option<&Path>) -> Result<SplitReport> {
        let fs = self.fs();
        let executable = new_host.unwrap_or(host).to_path_buf();
        let container = sibling_container_path(&executable);
        if new_host.is_some() && fs.same_file(host, &executable) {
            return Err(PckError::SameFileConflict(executable));
        }
        if fs.same_file(host, &container) || fs.same_file(&executable, &container) {
            return Err(PckError::SameFileConflict(container));
        }
        let footer = EmbedState::probe(fs, host)?.begin_rip(host)?;

        fs.check_writable(&container).map_err(|e| PckError::io_at(&container, e))?;
        let mut host_file = if new_host.is_some() {
            fs.check_writable(&executable).map_err(|e| PckError::io_at(&executable, e))?;
            fs.open(host)
        } else {
            fs.open_rw(host)
        }
        .map_err(|e| PckError::io_at(host, e))?;
        fs.create_dir_all(parent_dir(&executable)).map_err(|e| PckError::io_at(&executable, e))?;

        let pck_temp = self.extract_region(&mut host_file, &footer, &container)?;
        let exe_temp = match new_host {
            Some(_) => {
                let mut temp = TempFile::new(fs, &executable)?;
                host_file.seek(SeekFrom::Start(0))?;
                pump(&mut host_file, temp.file()?, footer.host_len, None, None)?;
                fs.copy_permissions(host, temp.path())?;
                Some(temp)
            }
            None => None,
        };

        pck_temp.commit(&container).map_err(|e| PckError::io_at(&container, e))?;
        match exe_temp {
            Some(temp) => temp.commit(&executable).map_err(|e| PckError::io_at(&executable, e))?,
            None => {
                host_file.set_len(footer.host_len)?;
                host_file.sync_all()?;
            }
        }

        tracing::info!(
            executable = %executable.display(),
            container = %container.display(),
            "container split"
        );
        Ok(SplitReport { executable, container, container_len: footer.container_len })
    }

    /// Copy the footer's container region into an uncommitted temp file
    /// beside `dest`.
    fn extract_region<'a>(
        &'a self,
        host:   &mut F::File,
        footer: &Footer,
        dest:   &Path,
    ) -> Result<TempFile<'a, F>> {
        let mut temp = TempFile::new(self.fs(), dest)?;
        host.seek(SeekFrom::Start(footer.container_offset))?;
        pump(host, temp.file()?, footer.container_len, None, None)?;
        Ok(temp)
    }

    fn remove_backup(&self, host: &Path) -> Result<bool> {
        let backup = backup_path(host);
        if !self.fs().exists(&backup) {
            return Ok(false);
        }
        self.fs().remove(&backup).map_err(|e| PckError::io_at(&backup, e))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(host_len: u64, container_len: u64) -> (Vec<u8>, MergePlan) {
        let plan = EmbedState::NotEmbedded { host_len }
            .begin_merge(Path::new("game"), container_len, 2)
            .unwrap();
        let mut file = vec![0x11u8; host_len as usize];
        file.resize(plan.footer.container_offset as usize, 0);
        file.extend(std::iter::repeat(0x22u8).take(container_len as usize));
        file.resize(file.len() + plan.tail_padding() as usize, 0);
        plan.footer.write(&mut file).unwrap();
        (file, plan)
    }

    #[test]
    fn plan_pads_to_alignment() {
        let (file, plan) = merged(13, 21);
        assert_eq!(plan.footer.container_offset, 16);
        assert_eq!(plan.padding(), 3);
        assert_eq!(plan.tail_padding(), 3);
        assert_eq!(file.len() as u64, plan.total_len());
        assert_eq!(plan.verdict, AlignmentVerdict::Suspect);
    }

    #[test]
    fn probe_round_trips_footer() {
        for (host_len, container_len) in [(0, 8), (13, 21), (4096, 100), (7, 1)] {
            let (file, plan) = merged(host_len, container_len);
            let state = EmbedState::probe_file(&mut Cursor::new(&file)).unwrap();
            assert_eq!(state, EmbedState::Embedded(plan.footer));
            assert_eq!(state.original_len(), host_len);
        }
    }

    #[test]
    fn ignores_inconsistent_footers() {
        let (mut file, _) = merged(16, 64);
        file.push(0);
        let state = EmbedState::probe_file(&mut Cursor::new(&file)).unwrap();
        assert_eq!(state, EmbedState::NotEmbedded { host_len: file.len() as u64 });

        let short = b"GDPC".to_vec();
        let state = EmbedState::probe_file(&mut Cursor::new(&short)).unwrap();
        assert_eq!(state, EmbedState::NotEmbedded { host_len: 4 });
    }

    #[test]
    fn footer_offsets_near_the_limit_are_not_footers() {
        let mut tail = Vec::new();
        Footer { host_len: u64::MAX, container_offset: 0, container_len: 0 }.write(&mut tail).unwrap();
        assert_eq!(Footer::parse(&tail, FOOTER_LEN), None);

        let mut tail = Vec::new();
        Footer { host_len: 0, container_offset: 0, container_len: u64::MAX - 3 }.write(&mut tail).unwrap();
        assert_eq!(Footer::parse(&tail, FOOTER_LEN), None);

        let mut file = vec![0x11u8; 40];
        Footer { host_len: u64::MAX - 1, container_offset: u64::MAX, container_len: 1 }
            .write(&mut file)
            .unwrap();
        let state = EmbedState::probe_file(&mut Cursor::new(&file)).unwrap();
        assert_eq!(state, EmbedState::NotEmbedded { host_len: 68 });
    }

    #[test]
    fn plans_past_the_addressable_range_fail() {
        let host = Path::new("game.exe");
        let huge = EmbedState::NotEmbedded { host_len: u64::MAX - 2 };
        assert!(matches!(
            huge.begin_merge(host, 1, 2),
            Err(PckError::Format(FormatError::LayoutOverflow))
        ));
        let plain = EmbedState::NotEmbedded { host_len: 16 };
        assert!(matches!(
            plain.begin_replace(u64::MAX - 20, 2),
            Err(PckError::Format(FormatError::LayoutOverflow))
        ));
    }

    #[test]
    fn transitions_check_preconditions() {
        let host = Path::new("game.exe");
        let (file, _) = merged(16, 64);
        let embedded = EmbedState::probe_file(&mut Cursor::new(&file)).unwrap();
        assert!(matches!(embedded.begin_merge(host, 10, 2), Err(PckError::AlreadyEmbedded(_))));
        assert!(embedded.begin_rip(host).is_ok());
        assert_eq!(embedded.begin_replace(10, 2).unwrap().footer.host_len, 16);

        let plain = EmbedState::NotEmbedded { host_len: 100 };
        assert!(matches!(plain.begin_rip(host), Err(PckError::NotEmbedded(_))));
    }

    #[test]
    fn alignment_policy_depends_on_revision() {
        assert_eq!(AlignmentVerdict::assess(1, 16, 64), AlignmentVerdict::Aligned);
        assert_eq!(AlignmentVerdict::assess(2, 16, 64), AlignmentVerdict::Aligned);
        assert_eq!(AlignmentVerdict::assess(1, 15, 64), AlignmentVerdict::Tolerated);
        assert_eq!(AlignmentVerdict::assess(2, 15, 64), AlignmentVerdict::Suspect);
        assert_eq!(AlignmentVerdict::assess(2, 16, 63), AlignmentVerdict::Suspect);
    }

    #[test]
    fn derived_names() {
        assert_eq!(backup_path(Path::new("dir/game.exe")), PathBuf::from("dir/game.old.exe"));
        assert_eq!(backup_path(Path::new("dir/game")), PathBuf::from("dir/game.old"));
        assert_eq!(sibling_container_path(Path::new("dir/game.exe")), PathBuf::from("dir/game.pck"));
        assert_eq!(sibling_container_path(Path::new("dir/game")), PathBuf::from("dir/game.pck"));
    }
}
