//! The 16-byte magic prefetch used to route a file to the right parser.

use std::fs::File;
use std::io::{self, Read};

use thiserror::Error;

use tbdgen_macho::{is_fat_magic, is_macho_magic, DSC_MAGIC_PREFIX};

pub const MAGIC_SIZE: usize = 16;

/// A scratch buffer holding the first bytes of a file. The buffer can be
/// handed from probe to probe so no byte is ever read twice.
#[derive(Debug, Clone, Default)]
pub struct MagicBuffer {
    pub buf: [u8; MAGIC_SIZE],
    pub len: usize,
}

impl MagicBuffer {
    pub fn new() -> MagicBuffer {
        MagicBuffer::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn is_dsc(&self) -> bool {
        self.bytes().starts_with(DSC_MAGIC_PREFIX)
    }

    pub fn is_macho(&self) -> bool {
        is_macho_magic(self.bytes()) || is_fat_magic(self.bytes())
    }
}

#[derive(Error, Debug)]
pub enum ReadMagicError {
    #[error("failed to read the file magic: {0}")]
    ReadFailed(#[source] io::Error),

    /// The file ended before 16 bytes; it cannot be a shared cache and the
    /// caller should fall through to Mach-O handling.
    #[error("the file is not large enough to hold a magic")]
    NotLargeEnough,
}

/// Ensures `magic` holds the first 16 bytes of `file`, reading only the
/// missing remainder.
pub fn read_magic(magic: &mut MagicBuffer, file: &mut File) -> Result<(), ReadMagicError> {
    while magic.len < MAGIC_SIZE {
        match file.read(&mut magic.buf[magic.len..]) {
            Ok(0) => return Err(ReadMagicError::NotLargeEnough),
            Ok(read) => magic.len += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(ReadMagicError::ReadFailed(error)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn file_with_contents(bytes: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    #[test]
    fn reads_exactly_sixteen_bytes() {
        let mut file = file_with_contents(b"dyld_v1  arm64e\0rest of the file");
        let mut magic = MagicBuffer::new();
        read_magic(&mut magic, &mut file).unwrap();
        assert_eq!(magic.len, MAGIC_SIZE);
        assert!(magic.is_dsc());
        assert!(!magic.is_macho());
    }

    #[test]
    fn short_file_is_not_large_enough() {
        let mut file = file_with_contents(b"tiny");
        let mut magic = MagicBuffer::new();
        match read_magic(&mut magic, &mut file) {
            Err(ReadMagicError::NotLargeEnough) => {}
            other => panic!("expected NotLargeEnough, got {other:?}"),
        }
    }

    #[test]
    fn already_filled_buffer_reads_nothing() {
        let mut file = file_with_contents(b"");
        let mut magic = MagicBuffer::new();
        magic.buf[..7].copy_from_slice(b"dyld_v1");
        magic.len = MAGIC_SIZE;
        read_magic(&mut magic, &mut file).unwrap();
        assert!(magic.is_dsc());
    }

    #[test]
    fn macho_magic_detected() {
        let mut bytes = vec![0u8; 32];
        bytes[0..4].copy_from_slice(&0xfeed_facfu32.to_le_bytes());
        let mut file = file_with_contents(&bytes);
        let mut magic = MagicBuffer::new();
        read_magic(&mut magic, &mut file).unwrap();
        assert!(magic.is_macho());
        assert!(!magic.is_dsc());
    }
}
