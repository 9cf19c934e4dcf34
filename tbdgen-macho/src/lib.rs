//! Binary-format support for the `tbdgen` stub generator.
//!
//! This crate knows how to look inside Apple binaries: it exposes a view
//! over dyld shared cache containers ([`DscView`]), a Mach-O image parser
//! that fills in a [`TbdRecord`] ([`parse_image`] / [`parse_file`]), and the
//! `.tbd` text serializer ([`TbdRecord::write_to`]). It deliberately knows
//! nothing about output routing, filtering or the command line; that policy
//! lives in the `tbdgen` binary.
//!
//! All parsing is performed against caller-owned byte slices (typically a
//! memory map), using the raw Mach-O definitions from the `object` crate.

mod arch;
mod dsc;
mod error;
mod macho;
mod tbd;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod test_fixtures;

pub use arch::{arch_name_for_cpu_type, is_known_arch_name, KNOWN_ARCH_NAMES};
pub use dsc::{DscMapping, DscParseOptions, DscView, ImageRecord, DSC_MAGIC_PREFIX};
pub use error::{DscParseError, ImageParseError};
pub use macho::{
    fat_members, is_fat_magic, is_macho_magic, parse_file, parse_image, FatMember,
    MachParseOptions,
};
pub use tbd::{
    write_footer, ExportGroup, ObjcConstraint, PackedVersion, Platform, TbdFlags, TbdRecord,
    TbdVersion, TbdWriteOptions,
};
