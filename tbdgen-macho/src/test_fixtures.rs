//! Builders for synthesizing tiny Mach-O dylibs, fat archives and dyld
//! shared caches in tests.
//!
//! Only compiled for tests and for the `test-fixtures` feature; nothing here
//! is part of the crate's public API proper.

/// Describes a minimal 64-bit little-endian dylib image.
#[derive(Debug, Clone)]
pub struct DylibFixture {
    pub install_name: String,
    pub current_version: u32,
    pub compatibility_version: u32,
    /// `(symbol, weak)` pairs placed in the export trie.
    pub exports: Vec<(String, bool)>,
    pub uuid: Option<[u8; 16]>,
    pub header_flags: u32,
    pub cputype: u32,
}

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_DYLIB: u32 = 0x6;
const MH_TWOLEVEL: u32 = 0x80;
const MH_APP_EXTENSION_SAFE: u32 = 0x0200_0000;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const LC_ID_DYLIB: u32 = 0xd;
const LC_UUID: u32 = 0x1b;
const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;

impl DylibFixture {
    pub fn new(install_name: &str) -> DylibFixture {
        DylibFixture {
            install_name: install_name.to_string(),
            current_version: 0x0001_0000,
            compatibility_version: 0x0001_0000,
            exports: Vec::new(),
            uuid: None,
            header_flags: MH_TWOLEVEL | MH_APP_EXTENSION_SAFE,
            cputype: CPU_TYPE_ARM64,
        }
    }

    pub fn cputype(mut self, cputype: u32) -> DylibFixture {
        self.cputype = cputype;
        self
    }

    pub fn export(mut self, name: &str) -> DylibFixture {
        self.exports.push((name.to_string(), false));
        self
    }

    pub fn weak_export(mut self, name: &str) -> DylibFixture {
        self.exports.push((name.to_string(), true));
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> DylibFixture {
        self.uuid = Some(uuid);
        self
    }

    /// Renders the image. Load command file offsets (the export trie) are
    /// made relative to `base_offset`, the image's position within the file
    /// it will be embedded in. Standalone files use `base_offset` 0.
    pub fn build(&self, base_offset: u64) -> Vec<u8> {
        let trie = build_export_trie(&self.exports);

        let name_bytes = self.install_name.as_bytes();
        let id_cmdsize = 24 + pad8(name_bytes.len() + 1);
        let uuid_cmdsize = 24;
        let version_min_cmdsize = 16;
        let dyld_info_cmdsize = 48;

        let mut ncmds = 3;
        let mut sizeofcmds = id_cmdsize + version_min_cmdsize + dyld_info_cmdsize;
        if self.uuid.is_some() {
            ncmds += 1;
            sizeofcmds += uuid_cmdsize;
        }

        let trie_offset = 32 + sizeofcmds;

        let mut buf = Vec::with_capacity(trie_offset + trie.len());
        // mach_header_64
        push_u32(&mut buf, MH_MAGIC_64);
        push_u32(&mut buf, self.cputype);
        push_u32(&mut buf, 0); // cpusubtype
        push_u32(&mut buf, MH_DYLIB);
        push_u32(&mut buf, ncmds);
        push_u32(&mut buf, sizeofcmds as u32);
        push_u32(&mut buf, self.header_flags);
        push_u32(&mut buf, 0); // reserved

        // LC_ID_DYLIB
        push_u32(&mut buf, LC_ID_DYLIB);
        push_u32(&mut buf, id_cmdsize as u32);
        push_u32(&mut buf, 24); // name offset
        push_u32(&mut buf, 2); // timestamp
        push_u32(&mut buf, self.current_version);
        push_u32(&mut buf, self.compatibility_version);
        buf.extend_from_slice(name_bytes);
        buf.push(0);
        while buf.len() % 8 != 0 {
            buf.push(0);
        }

        // LC_VERSION_MIN_IPHONEOS
        push_u32(&mut buf, LC_VERSION_MIN_IPHONEOS);
        push_u32(&mut buf, version_min_cmdsize as u32);
        push_u32(&mut buf, 0x000b_0000); // minos 11.0
        push_u32(&mut buf, 0x000b_0000); // sdk 11.0

        if let Some(uuid) = self.uuid {
            push_u32(&mut buf, LC_UUID);
            push_u32(&mut buf, uuid_cmdsize as u32);
            buf.extend_from_slice(&uuid);
        }

        // LC_DYLD_INFO_ONLY, everything zero except the export trie
        push_u32(&mut buf, LC_DYLD_INFO_ONLY);
        push_u32(&mut buf, dyld_info_cmdsize as u32);
        for _ in 0..8 {
            push_u32(&mut buf, 0);
        }
        push_u32(&mut buf, (base_offset + trie_offset as u64) as u32);
        push_u32(&mut buf, trie.len() as u32);

        assert_eq!(buf.len(), trie_offset);
        buf.extend_from_slice(&trie);
        buf
    }
}

/// A one-level export trie: every symbol is a full edge off the root.
fn build_export_trie(exports: &[(String, bool)]) -> Vec<u8> {
    if exports.is_empty() {
        // A trie with an empty, terminal-less root.
        return vec![0, 0];
    }

    let root_size: usize = 2 + exports
        .iter()
        .map(|(name, _)| name.len() + 2)
        .sum::<usize>();

    let mut trie = Vec::new();
    trie.push(0); // no terminal at the root
    trie.push(exports.len() as u8);
    for (index, (name, _)) in exports.iter().enumerate() {
        trie.extend_from_slice(name.as_bytes());
        trie.push(0);
        let child_offset = root_size + index * 3;
        assert!(child_offset < 128, "fixture trie too large");
        trie.push(child_offset as u8);
    }
    assert_eq!(trie.len(), root_size);

    for (_, weak) in exports {
        trie.push(2); // terminal payload size
        trie.push(if *weak { 0x04 } else { 0x00 }); // flags
        trie.push(0); // address
    }
    trie
}

const DSC_BASE_ADDRESS: u64 = 0x1_8000_0000;
const DSC_HEADER_SIZE: usize = 0x800;

/// Builds a single-mapping shared cache containing the given images, using
/// the classic image-table layout.
pub fn build_cache(images: &[(&str, DylibFixture)]) -> Vec<u8> {
    let mapping_offset = DSC_HEADER_SIZE;
    let images_offset = mapping_offset + 32;
    let paths_offset = images_offset + images.len() * 32;

    let mut path_offsets = Vec::new();
    let mut paths_block = Vec::new();
    for (path, _) in images {
        path_offsets.push(paths_offset + paths_block.len());
        paths_block.extend_from_slice(path.as_bytes());
        paths_block.push(0);
    }

    let mut image_offsets = Vec::new();
    let mut images_block = Vec::new();
    let images_base = pad_to(paths_offset + paths_block.len(), 8);
    for (_, dylib) in images {
        let offset = images_base + images_block.len();
        image_offsets.push(offset);
        images_block.extend_from_slice(&dylib.build(offset as u64));
        while images_block.len() % 8 != 0 {
            images_block.push(0);
        }
    }

    let total_size = images_base + images_block.len();
    let mut buf = vec![0u8; total_size];

    // header
    buf[0..16].copy_from_slice(b"dyld_v1  arm64\0\0");
    put_u32(&mut buf, 0x10, mapping_offset as u32);
    put_u32(&mut buf, 0x14, 1); // mapping_count
    put_u32(&mut buf, 0x18, images_offset as u32);
    put_u32(&mut buf, 0x1c, images.len() as u32);

    // one mapping covering the whole file, identity-translated
    put_u64(&mut buf, mapping_offset, DSC_BASE_ADDRESS);
    put_u64(&mut buf, mapping_offset + 8, total_size as u64);
    put_u64(&mut buf, mapping_offset + 16, 0); // file_offset
    put_u32(&mut buf, mapping_offset + 24, 5); // max_prot
    put_u32(&mut buf, mapping_offset + 28, 5); // init_prot

    // image table
    for (index, image_offset) in image_offsets.iter().enumerate() {
        let entry = images_offset + index * 32;
        put_u64(&mut buf, entry, DSC_BASE_ADDRESS + *image_offset as u64);
        put_u64(&mut buf, entry + 8, 0); // mod_time
        put_u64(&mut buf, entry + 16, 0); // inode
        put_u32(&mut buf, entry + 24, path_offsets[index] as u32);
        put_u32(&mut buf, entry + 28, 0); // pad
    }

    buf[paths_offset..paths_offset + paths_block.len()].copy_from_slice(&paths_block);
    buf[images_base..].copy_from_slice(&images_block);
    buf
}

/// Builds a 32-bit fat archive from pre-rendered member images.
pub fn build_fat(members: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    const FAT_MAGIC: u32 = 0xcafe_babe;
    let header_size = 8 + members.len() * 20;

    let mut offsets = Vec::new();
    let mut next = pad_to(header_size, 8);
    for (_, _, bytes) in members {
        offsets.push(next);
        next = pad_to(next + bytes.len(), 8);
    }

    let mut buf = vec![0u8; next];
    put_u32_be(&mut buf, 0, FAT_MAGIC);
    put_u32_be(&mut buf, 4, members.len() as u32);
    for (index, (cputype, cpusubtype, bytes)) in members.iter().enumerate() {
        let entry = 8 + index * 20;
        put_u32_be(&mut buf, entry, *cputype);
        put_u32_be(&mut buf, entry + 4, *cpusubtype);
        put_u32_be(&mut buf, entry + 8, offsets[index] as u32);
        put_u32_be(&mut buf, entry + 12, bytes.len() as u32);
        put_u32_be(&mut buf, entry + 16, 3); // align: 2^3
        buf[offsets[index]..offsets[index] + bytes.len()].copy_from_slice(bytes);
    }
    buf
}

fn pad8(len: usize) -> usize {
    pad_to(len, 8)
}

fn pad_to(len: usize, align: usize) -> usize {
    len.div_ceil(align) * align
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32_be(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
