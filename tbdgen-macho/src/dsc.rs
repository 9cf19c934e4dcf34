//! A read-only view over a dyld shared cache file.
//!
//! The view copies the mapping table and the image table out of the cache at
//! parse time; the backing bytes (usually a memory map owned by the caller)
//! are only consulted for image paths and image contents.

use bitflags::bitflags;

use object::macho::{DyldCacheHeader, DyldCacheImageInfo, DyldCacheMappingInfo};
use object::read::ReadRef;
use object::LittleEndian;

use crate::error::DscParseError;

/// The first eight bytes of every dyld shared cache file, e.g.
/// `dyld_v1  arm64e`.
pub const DSC_MAGIC_PREFIX: &[u8] = b"dyld_v1";

bitflags! {
    #[derive(Default)]
    pub struct DscParseOptions: u32 {
        /// Zero the scratch byte of every image record. Callers that use the
        /// scratch bits for bookkeeping must pass this.
        const ZERO_IMAGE_PADS = 1 << 0;
    }
}

/// One entry of the cache's image table.
///
/// `pad` is a scratch byte for the caller's bookkeeping; the parser leaves it
/// zeroed under [`DscParseOptions::ZERO_IMAGE_PADS`].
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub address: u64,
    pub path_file_offset: u32,
    pub pad: u8,
}

/// One entry of the cache's mapping table.
#[derive(Debug, Clone, Copy)]
pub struct DscMapping {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
}

/// An immutable view of the cache data plus owned copies of its tables.
pub struct DscView<'data> {
    data: &'data [u8],
    mappings: Vec<DscMapping>,
    pub images: Vec<ImageRecord>,
}

impl<'data> DscView<'data> {
    /// Parses the cache header, mapping table and image table.
    ///
    /// Fails with [`DscParseError::NotACache`] when the magic does not match,
    /// so that callers can fall back to treating the file as a plain Mach-O.
    pub fn parse(data: &'data [u8], options: DscParseOptions) -> Result<DscView<'data>, DscParseError> {
        if data.len() < DSC_MAGIC_PREFIX.len() || !data.starts_with(DSC_MAGIC_PREFIX) {
            return Err(DscParseError::NotACache);
        }

        let endian = LittleEndian;
        let header = data
            .read_at::<DyldCacheHeader<LittleEndian>>(0)
            .map_err(|()| DscParseError::TruncatedHeader)?;

        let mapping_offset = u64::from(header.mapping_offset.get(endian));
        let mapping_count = header.mapping_count.get(endian) as usize;
        let raw_mappings = data
            .read_slice_at::<DyldCacheMappingInfo<LittleEndian>>(mapping_offset, mapping_count)
            .map_err(|()| DscParseError::MappingTableOutOfBounds)?;

        // Caches from before the split-cache era keep the image table right
        // behind the leading header fields; newer caches zero those fields
        // and relocate the table.
        let (images_offset, images_count) = if header.images_count_old.get(endian) != 0 {
            (
                u64::from(header.images_offset_old.get(endian)),
                header.images_count_old.get(endian) as usize,
            )
        } else {
            (
                u64::from(header.images_offset.get(endian)),
                header.images_count.get(endian) as usize,
            )
        };
        let raw_images = data
            .read_slice_at::<DyldCacheImageInfo<LittleEndian>>(images_offset, images_count)
            .map_err(|()| DscParseError::ImageTableOutOfBounds)?;

        let mappings: Vec<DscMapping> = raw_mappings
            .iter()
            .map(|mapping| DscMapping {
                address: mapping.address.get(endian),
                size: mapping.size.get(endian),
                file_offset: mapping.file_offset.get(endian),
            })
            .collect();

        let mut images = Vec::with_capacity(images_count);
        for raw in raw_images {
            let record = ImageRecord {
                address: raw.address.get(endian),
                path_file_offset: raw.path_file_offset.get(endian),
                pad: if options.contains(DscParseOptions::ZERO_IMAGE_PADS) {
                    0
                } else {
                    raw.pad.get(endian) as u8
                },
            };
            validate_image_path(data, record.path_file_offset)?;
            images.push(record);
        }

        Ok(DscView {
            data,
            mappings,
            images,
        })
    }

    /// The backing bytes of the whole cache file.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    pub fn images_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// The NUL-terminated path of the image at `index`.
    ///
    /// Paths were validated at parse time; the empty-string fallbacks here
    /// are defensive and lead to the image being skipped by callers.
    pub fn image_path_at(&self, index: usize) -> &'data str {
        let start = self.images[index].path_file_offset as usize;
        let Some(tail) = self.data.get(start..) else {
            return "";
        };
        let Some(len) = memchr::memchr(0, tail) else {
            return "";
        };
        std::str::from_utf8(&tail[..len]).unwrap_or("")
    }

    /// Translates a VM address through the mapping table into a file offset.
    pub fn file_offset_for_address(&self, address: u64) -> Option<u64> {
        self.mappings.iter().find_map(|mapping| {
            if address >= mapping.address && address - mapping.address < mapping.size {
                Some(mapping.file_offset + (address - mapping.address))
            } else {
                None
            }
        })
    }
}

fn validate_image_path(data: &[u8], path_file_offset: u32) -> Result<(), DscParseError> {
    let offset = path_file_offset as usize;
    let tail = data
        .get(offset..)
        .ok_or(DscParseError::ImagePathOutOfBounds(path_file_offset as u64))?;
    let len = memchr::memchr(0, tail)
        .ok_or(DscParseError::ImagePathOutOfBounds(path_file_offset as u64))?;
    std::str::from_utf8(&tail[..len])
        .map_err(|_| DscParseError::ImagePathNotUtf8(path_file_offset as u64))?;
    Ok(())
}
