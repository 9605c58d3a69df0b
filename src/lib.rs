pub mod version;
pub mod header;
pub mod index;
pub mod crypto;
pub mod io_stream;
pub mod error;
pub mod fs;
pub mod embed;
pub mod discover;
pub mod packer;
pub mod patch;
pub mod archive;

pub use version::{PckVersion, VersionError};
pub use header::{PckHeader, Revision};
pub use index::{PckEntry, PckIndex};
pub use crypto::{CryptoError, EncryptionKey};
pub use io_stream::{PckReader, PckWriter, WriteOptions};
pub use error::{FormatError, PckError, Result};
pub use fs::{Fs, FsFile, StdFs};
pub use embed::{AlignmentVerdict, EmbedState, Footer, MergeReport, RipReport, SplitReport};
pub use discover::{discover, DiscoveredFile};
pub use packer::{ExtractOptions, ExtractReport, PackOptions, PackReport, PackSource};
pub use archive::{EntryInfo, Location, PckArchive, PckInfo, PckTool};
