//! Mach-O image parsing into the `.tbd` render state.
//!
//! The same parser serves standalone dylib files, members of fat archives,
//! and images inside a dyld shared cache: callers pass the bytes the image's
//! load command offsets are relative to (the member slice for fat archives,
//! the whole cache file for shared cache images) plus the header offset
//! within them.

use bitflags::bitflags;

use object::macho::{
    self, BuildVersionCommand, DylibCommand, DyldInfoCommand, FatHeader, LinkeditDataCommand,
    MachHeader32, MachHeader64, SubClientCommand, SubFrameworkCommand, SymtabCommand, UuidCommand,
};
use object::read::macho::{FatArch, MachHeader, Nlist};
use object::read::ReadRef;
use object::Endianness;
use uuid::Uuid;

use crate::arch::arch_name_for_cpu_type;
use crate::error::ImageParseError;
use crate::tbd::{ExportGroup, ObjcConstraint, PackedVersion, Platform, TbdFlags, TbdRecord};

bitflags! {
    /// Options controlling which symbols the parser admits into the export
    /// set.
    #[derive(Default)]
    pub struct MachParseOptions: u32 {
        const ALLOW_PRIVATE_NORMAL_SYMBOLS = 1 << 0;
        const ALLOW_PRIVATE_WEAK_SYMBOLS = 1 << 1;
        const ALLOW_PRIVATE_OBJC_CLASSES = 1 << 2;
        const ALLOW_PRIVATE_OBJC_IVARS = 1 << 3;
    }
}

impl MachParseOptions {
    pub fn allow_all_private_symbols() -> MachParseOptions {
        MachParseOptions::all()
    }

    pub fn allow_private_objc_symbols() -> MachParseOptions {
        MachParseOptions::ALLOW_PRIVATE_OBJC_CLASSES | MachParseOptions::ALLOW_PRIVATE_OBJC_IVARS
    }
}

// Export trie terminal flags, from dyld's loader.h.
const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;

/// Hard bounds against malformed tries that loop or explode.
const MAX_TRIE_NODES: usize = 1 << 20;
const MAX_SYMBOL_LENGTH: usize = 4096;

/// Parses the Mach-O image at `header_offset` into `record`.
///
/// On [`ImageParseError::NoExports`] the record has still been fully
/// populated apart from the export lists; callers decide whether that is an
/// error or a warning.
pub fn parse_image(
    record: &mut TbdRecord,
    data: &[u8],
    header_offset: u64,
    options: MachParseOptions,
) -> Result<(), ImageParseError> {
    let offset = header_offset as usize;
    let magic_bytes = data
        .get(offset..offset + 4)
        .ok_or(ImageParseError::NotAMachO)?;
    let magic = u32::from_le_bytes([
        magic_bytes[0],
        magic_bytes[1],
        magic_bytes[2],
        magic_bytes[3],
    ]);

    match magic {
        macho::MH_MAGIC_64 | macho::MH_CIGAM_64 => {
            parse_image_impl::<MachHeader64<Endianness>>(record, data, header_offset, options)
        }
        macho::MH_MAGIC | macho::MH_CIGAM => {
            parse_image_impl::<MachHeader32<Endianness>>(record, data, header_offset, options)
        }
        _ => Err(ImageParseError::NotAMachO),
    }
}

fn parse_image_impl<M: MachHeader>(
    record: &mut TbdRecord,
    data: &[u8],
    header_offset: u64,
    options: MachParseOptions,
) -> Result<(), ImageParseError> {
    let header = M::parse(data, header_offset).map_err(ImageParseError::MachHeaderParse)?;
    let endian = header.endian().map_err(ImageParseError::MachHeaderParse)?;

    let cputype = header.cputype(endian);
    let cpusubtype = header.cpusubtype(endian);
    let arch = arch_name_for_cpu_type(cputype, cpusubtype)
        .ok_or(ImageParseError::UnknownArchitecture(cputype, cpusubtype))?;

    let header_flags = header.flags(endian);
    if header_flags & macho::MH_TWOLEVEL == 0 {
        record.flags |= TbdFlags::FLAT_NAMESPACE;
    }
    if header_flags & macho::MH_APP_EXTENSION_SAFE == 0 {
        record.flags |= TbdFlags::NOT_APP_EXTENSION_SAFE;
    }

    let mut install_name = None;
    let mut current_version = None;
    let mut compatibility_version = None;
    let mut uuid = None;
    let mut platform = None;
    let mut export_trie: Option<(u64, u64)> = None;
    let mut symtab: Option<(u64, usize, u64, u64)> = None;
    let mut group = ExportGroup::new(arch);

    let mut commands = header
        .load_commands(endian, data, header_offset)
        .map_err(ImageParseError::LoadCommandParse)?;
    while let Some(command) = commands
        .next()
        .map_err(ImageParseError::LoadCommandParse)?
    {
        match command.cmd() {
            macho::LC_ID_DYLIB => {
                let dylib: &DylibCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                let name = command
                    .string(endian, dylib.dylib.name)
                    .map_err(ImageParseError::LoadCommandParse)?;
                install_name = Some(String::from_utf8_lossy(name).into_owned());
                current_version = Some(PackedVersion(dylib.dylib.current_version.get(endian)));
                compatibility_version =
                    Some(PackedVersion(dylib.dylib.compatibility_version.get(endian)));
            }
            macho::LC_REEXPORT_DYLIB => {
                let dylib: &DylibCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                let name = command
                    .string(endian, dylib.dylib.name)
                    .map_err(ImageParseError::LoadCommandParse)?;
                group
                    .reexports
                    .push(String::from_utf8_lossy(name).into_owned());
            }
            macho::LC_SUB_CLIENT => {
                let sub: &SubClientCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                let name = command
                    .string(endian, sub.client)
                    .map_err(ImageParseError::LoadCommandParse)?;
                group
                    .clients
                    .push(String::from_utf8_lossy(name).into_owned());
            }
            macho::LC_SUB_FRAMEWORK => {
                let sub: &SubFrameworkCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                let name = command
                    .string(endian, sub.umbrella)
                    .map_err(ImageParseError::LoadCommandParse)?;
                record.parent_umbrella = Some(String::from_utf8_lossy(name).into_owned());
            }
            macho::LC_UUID => {
                let cmd: &UuidCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                uuid = Some(Uuid::from_bytes(cmd.uuid));
            }
            macho::LC_BUILD_VERSION => {
                let cmd: &BuildVersionCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                platform = Platform::from_build_version(cmd.platform.get(endian));
            }
            macho::LC_VERSION_MIN_MACOSX => platform = Some(Platform::MacOsx),
            macho::LC_VERSION_MIN_IPHONEOS => platform = Some(Platform::Ios),
            macho::LC_VERSION_MIN_WATCHOS => platform = Some(Platform::Watchos),
            macho::LC_VERSION_MIN_TVOS => platform = Some(Platform::Tvos),
            macho::LC_DYLD_INFO | macho::LC_DYLD_INFO_ONLY => {
                let cmd: &DyldInfoCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                let export_off = u64::from(cmd.export_off.get(endian));
                let export_size = u64::from(cmd.export_size.get(endian));
                if export_size != 0 {
                    export_trie = Some((export_off, export_size));
                }
            }
            macho::LC_DYLD_EXPORTS_TRIE => {
                let cmd: &LinkeditDataCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                let dataoff = u64::from(cmd.dataoff.get(endian));
                let datasize = u64::from(cmd.datasize.get(endian));
                if datasize != 0 {
                    export_trie = Some((dataoff, datasize));
                }
            }
            macho::LC_SYMTAB => {
                let cmd: &SymtabCommand<M::Endian> = command
                    .data()
                    .map_err(ImageParseError::LoadCommandParse)?;
                symtab = Some((
                    u64::from(cmd.symoff.get(endian)),
                    cmd.nsyms.get(endian) as usize,
                    u64::from(cmd.stroff.get(endian)),
                    u64::from(cmd.strsize.get(endian)),
                ));
            }
            _ => {}
        }
    }

    let install_name = install_name.ok_or(ImageParseError::NotADylib)?;

    if let Some((export_off, export_size)) = export_trie {
        let trie = data
            .read_bytes_at(export_off, export_size)
            .map_err(|()| ImageParseError::ExportTrieOutOfBounds)?;
        parse_export_trie(&mut group, trie)?;
    } else if let Some((symoff, nsyms, stroff, strsize)) = symtab {
        parse_symtab::<M>(&mut group, data, endian, symoff, nsyms, stroff, strsize, options)?;
    }

    let no_exports = group.is_empty();

    record.archs.push(arch.to_string());
    if let Some(uuid) = uuid {
        record.uuids.push((arch.to_string(), uuid));
    }
    if platform.is_some() {
        record.platform = platform;
    }
    record.install_name = Some(install_name);
    record.current_version = current_version;
    record.compatibility_version = compatibility_version;
    if record.objc_constraint.is_none() {
        record.objc_constraint = Some(ObjcConstraint::RetainRelease);
    }
    record.exports.push(group);

    if no_exports {
        return Err(ImageParseError::NoExports);
    }
    Ok(())
}

/// Walks the export trie, classifying each terminal symbol.
fn parse_export_trie(group: &mut ExportGroup, trie: &[u8]) -> Result<(), ImageParseError> {
    let mut stack = vec![(0usize, String::new())];
    let mut visited = 0usize;

    while let Some((node_offset, prefix)) = stack.pop() {
        visited += 1;
        if visited > MAX_TRIE_NODES || prefix.len() > MAX_SYMBOL_LENGTH {
            return Err(ImageParseError::MalformedExportTrie);
        }

        let (terminal_size, payload_offset) = read_uleb128(trie, node_offset)?;
        if terminal_size != 0 {
            let (flags, _) = read_uleb128(trie, payload_offset)?;
            let weak = flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0;
            push_export_name(group, &prefix, weak);
        }

        let children_offset = payload_offset
            .checked_add(terminal_size as usize)
            .ok_or(ImageParseError::MalformedExportTrie)?;
        let child_count = *trie
            .get(children_offset)
            .ok_or(ImageParseError::MalformedExportTrie)?;

        let mut cursor = children_offset + 1;
        for _ in 0..child_count {
            let tail = trie
                .get(cursor..)
                .ok_or(ImageParseError::MalformedExportTrie)?;
            let edge_len =
                memchr::memchr(0, tail).ok_or(ImageParseError::MalformedExportTrie)?;
            let edge = std::str::from_utf8(&tail[..edge_len])
                .map_err(|_| ImageParseError::MalformedExportTrie)?;
            cursor += edge_len + 1;

            let (child_offset, next) = read_uleb128(trie, cursor)?;
            cursor = next;

            let mut child_prefix = String::with_capacity(prefix.len() + edge.len());
            child_prefix.push_str(&prefix);
            child_prefix.push_str(edge);
            stack.push((child_offset as usize, child_prefix));
        }
    }

    Ok(())
}

/// Reads one uleb128-encoded value, returning it and the offset just past it.
fn read_uleb128(data: &[u8], mut offset: usize) -> Result<(u64, usize), ImageParseError> {
    const CONTINUATION_BIT: u8 = 1 << 7;

    let mut result = 0;
    let mut shift = 0;

    loop {
        let byte = *data
            .get(offset)
            .ok_or(ImageParseError::MalformedExportTrie)?;
        offset += 1;
        if shift == 63 && byte != 0x00 && byte != 0x01 {
            return Err(ImageParseError::MalformedExportTrie);
        }

        let low_bits = u64::from(byte & !CONTINUATION_BIT);
        result |= low_bits << shift;

        if byte & CONTINUATION_BIT == 0 {
            return Ok((result, offset));
        }

        shift += 7;
    }
}

fn push_export_name(group: &mut ExportGroup, name: &str, weak: bool) {
    if let Some(class_name) = name
        .strip_prefix("_OBJC_CLASS_$_")
        .or_else(|| name.strip_prefix("_OBJC_METACLASS_$_"))
    {
        group.objc_classes.push(class_name.to_string());
    } else if let Some(ivar_name) = name.strip_prefix("_OBJC_IVAR_$_") {
        group.objc_ivars.push(ivar_name.to_string());
    } else if weak {
        group.weak_symbols.push(name.to_string());
    } else {
        group.symbols.push(name.to_string());
    }
}

#[allow(clippy::too_many_arguments)]
fn parse_symtab<M: MachHeader>(
    group: &mut ExportGroup,
    data: &[u8],
    endian: M::Endian,
    symoff: u64,
    nsyms: usize,
    stroff: u64,
    strsize: u64,
    options: MachParseOptions,
) -> Result<(), ImageParseError> {
    let nlists = data
        .read_slice_at::<M::Nlist>(symoff, nsyms)
        .map_err(|()| ImageParseError::SymbolTableOutOfBounds)?;
    let strings = data
        .read_bytes_at(stroff, strsize)
        .map_err(|()| ImageParseError::SymbolTableOutOfBounds)?;

    for nlist in nlists {
        let n_type = nlist.n_type();
        if n_type & macho::N_STAB != 0 {
            continue;
        }
        if n_type & macho::N_TYPE != macho::N_SECT {
            continue;
        }

        let tail = match strings.get(nlist.n_strx(endian) as usize..) {
            Some(tail) => tail,
            None => continue,
        };
        let name = match memchr::memchr(0, tail)
            .and_then(|len| std::str::from_utf8(&tail[..len]).ok())
        {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };

        let external = n_type & macho::N_EXT != 0;
        let weak = nlist.n_desc(endian) & macho::N_WEAK_DEF != 0;
        if !external && !private_symbol_allowed(name, weak, options) {
            continue;
        }

        push_export_name(group, name, weak);
    }
    Ok(())
}

fn private_symbol_allowed(name: &str, weak: bool, options: MachParseOptions) -> bool {
    if name.starts_with("_OBJC_CLASS_$_") || name.starts_with("_OBJC_METACLASS_$_") {
        options.contains(MachParseOptions::ALLOW_PRIVATE_OBJC_CLASSES)
    } else if name.starts_with("_OBJC_IVAR_$_") {
        options.contains(MachParseOptions::ALLOW_PRIVATE_OBJC_IVARS)
    } else if weak {
        options.contains(MachParseOptions::ALLOW_PRIVATE_WEAK_SYMBOLS)
    } else {
        options.contains(MachParseOptions::ALLOW_PRIVATE_NORMAL_SYMBOLS)
    }
}

/// One member of a fat (universal) archive.
#[derive(Debug, Clone)]
pub struct FatMember {
    pub offset: u64,
    pub size: u64,
    pub arch: Option<&'static str>,
}

/// Enumerates the members of a fat archive.
pub fn fat_members(data: &[u8]) -> Result<Vec<FatMember>, ImageParseError> {
    let magic_bytes = data.get(0..4).ok_or(ImageParseError::NotAMachO)?;
    let magic = u32::from_be_bytes([
        magic_bytes[0],
        magic_bytes[1],
        magic_bytes[2],
        magic_bytes[3],
    ]);

    let members: Vec<FatMember> = match magic {
        macho::FAT_MAGIC => FatHeader::parse_arch32(data)
            .map_err(ImageParseError::FatHeaderParse)?
            .iter()
            .map(fat_member)
            .collect(),
        macho::FAT_MAGIC_64 => FatHeader::parse_arch64(data)
            .map_err(ImageParseError::FatHeaderParse)?
            .iter()
            .map(fat_member)
            .collect(),
        _ => return Err(ImageParseError::NotAMachO),
    };

    if members.is_empty() {
        return Err(ImageParseError::EmptyFatArchive);
    }
    Ok(members)
}

fn fat_member<FA: FatArch>(fat_arch: &FA) -> FatMember {
    let (offset, size) = fat_arch.file_range();
    FatMember {
        offset,
        size,
        arch: arch_name_for_cpu_type(fat_arch.cputype(), fat_arch.cpusubtype()),
    }
}

/// Whether the first bytes of a file look like a fat archive.
pub fn is_fat_magic(data: &[u8]) -> bool {
    data.len() >= 4 && {
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        magic == macho::FAT_MAGIC || magic == macho::FAT_MAGIC_64
    }
}

/// Whether the first bytes of a file look like a thin Mach-O.
pub fn is_macho_magic(data: &[u8]) -> bool {
    data.len() >= 4 && {
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        matches!(
            magic,
            macho::MH_MAGIC | macho::MH_CIGAM | macho::MH_MAGIC_64 | macho::MH_CIGAM_64
        )
    }
}

/// Parses a standalone Mach-O file, thin or fat, merging fat members into a
/// single record.
pub fn parse_file(
    record: &mut TbdRecord,
    data: &[u8],
    options: MachParseOptions,
) -> Result<(), ImageParseError> {
    if !is_fat_magic(data) {
        return parse_image(record, data, 0, options);
    }

    let members = fat_members(data)?;
    let mut no_exports = true;
    let mut first = true;
    for member in &members {
        let start = member.offset as usize;
        let end = start
            .checked_add(member.size as usize)
            .ok_or(ImageParseError::NotAMachO)?;
        let slice = data
            .get(start..end)
            .ok_or(ImageParseError::NotAMachO)?;

        if first {
            match parse_image(record, slice, 0, options) {
                Ok(()) => no_exports = false,
                Err(ImageParseError::NoExports) => {}
                Err(e) => return Err(e),
            }
            first = false;
        } else {
            let mut member_record = TbdRecord::new(record.version);
            match parse_image(&mut member_record, slice, 0, options) {
                Ok(()) => no_exports = false,
                Err(ImageParseError::NoExports) => {}
                Err(e) => return Err(e),
            }
            merge_member(record, member_record);
        }
    }

    if no_exports {
        return Err(ImageParseError::NoExports);
    }
    Ok(())
}

/// Folds another fat member's record into the merged record. Export groups
/// with identical contents collapse into one group spanning both archs.
fn merge_member(record: &mut TbdRecord, member: TbdRecord) {
    record.archs.extend(member.archs);
    record.uuids.extend(member.uuids);
    record.flags |= member.flags;
    if record.platform.is_none() {
        record.platform = member.platform;
    }
    for group in &mut record.exports {
        group.sort_and_dedup();
    }
    for mut group in member.exports {
        group.sort_and_dedup();
        match record
            .exports
            .iter_mut()
            .find(|existing| existing.same_contents(&group))
        {
            Some(existing) => existing.archs.append(&mut group.archs),
            None => record.exports.push(group),
        }
    }
}
