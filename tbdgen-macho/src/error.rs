use thiserror::Error;

/// Errors from parsing a dyld shared cache container.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DscParseError {
    #[error("The file does not start with a dyld_v1 magic")]
    NotACache,

    #[error("The dyld shared cache header could not be read")]
    TruncatedHeader,

    #[error("The dyld shared cache mapping table is out of bounds")]
    MappingTableOutOfBounds,

    #[error("The dyld shared cache image table is out of bounds")]
    ImageTableOutOfBounds,

    #[error("Image path at file offset {0:#x} is out of bounds or missing its terminator")]
    ImagePathOutOfBounds(u64),

    #[error("Image path at file offset {0:#x} is not valid UTF-8")]
    ImagePathNotUtf8(u64),
}

/// Errors from parsing a single Mach-O image, either standalone or out of a
/// shared cache.
///
/// [`ImageParseError::NoExports`] is special: the rest of the record has been
/// populated and callers may choose to treat it as a warning.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ImageParseError {
    #[error("No shared cache mapping covers the image address {0:#x}")]
    UnmappedImageAddress(u64),

    #[error("Mach-O header parsing error: {0}")]
    MachHeaderParse(#[source] object::read::Error),

    #[error("Load command parsing error: {0}")]
    LoadCommandParse(#[source] object::read::Error),

    #[error("The file does not start with a Mach-O magic")]
    NotAMachO,

    #[error("The image has no LC_ID_DYLIB load command")]
    NotADylib,

    #[error("Unrecognized architecture (cputype {0:#x}, cpusubtype {1:#x})")]
    UnknownArchitecture(u32, u32),

    #[error("The export trie is out of bounds")]
    ExportTrieOutOfBounds,

    #[error("The export trie is malformed")]
    MalformedExportTrie,

    #[error("The symbol table is out of bounds")]
    SymbolTableOutOfBounds,

    #[error("The fat archive does not contain any architectures")]
    EmptyFatArchive,

    #[error("Fat archive parsing error: {0}")]
    FatHeaderParse(#[source] object::read::Error),

    #[error("The image has no exported symbols or re-exports")]
    NoExports,
}
