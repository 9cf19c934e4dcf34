//! The `--list-*` commands.

use std::fs::File;
use std::path::Path;
use std::process;

use tbdgen_macho::{
    arch_name_for_cpu_type, fat_members, DscParseOptions, DscView, ObjcConstraint, Platform,
    TbdFlags, TbdVersion, KNOWN_ARCH_NAMES,
};

use crate::magic::{read_magic, MagicBuffer};

pub fn print_tbd_versions() {
    for version in TbdVersion::ALL {
        println!("{}", version.name());
    }
}

pub fn print_tbd_flags() {
    for (name, _) in TbdFlags::NAMES {
        println!("{name}");
    }
}

pub fn print_objc_constraints() {
    for constraint in ObjcConstraint::ALL {
        println!("{}", constraint.name());
    }
}

pub fn print_platforms() {
    for platform in Platform::ALL {
        println!("{}", platform.name());
    }
}

/// Without a path, lists every architecture name a `.tbd` can carry; with
/// one, lists the architectures of the mach-o file there.
pub fn print_architectures(path: Option<&Path>) {
    let Some(path) = path else {
        for name in KNOWN_ARCH_NAMES {
            println!("{name}");
        }
        return;
    };

    let mmap = map_file(path);
    if tbdgen_macho::is_fat_magic(&mmap) {
        let members = match fat_members(&mmap) {
            Ok(members) => members,
            Err(error) => {
                eprintln!(
                    "Failed to parse the mach-o file (at path {}), error: {}",
                    path.display(),
                    error
                );
                process::exit(1);
            }
        };
        for member in members {
            println!("{}", member.arch.unwrap_or("(unknown)"));
        }
        return;
    }

    match thin_arch_name(&mmap) {
        Some(name) => println!("{name}"),
        None => {
            eprintln!("File (at path {}) is not a mach-o file", path.display());
            process::exit(1);
        }
    }
}

/// Prints the image table of the shared cache at `path`, optionally sorted
/// lexicographically by path.
pub fn print_dsc_images(path: &Path, ordered: bool) {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(error) => {
            eprintln!(
                "Failed to open file (at path {}), error: {}",
                path.display(),
                error
            );
            process::exit(1);
        }
    };

    let mut magic = MagicBuffer::new();
    if read_magic(&mut magic, &mut file).is_err() || !magic.is_dsc() {
        eprintln!(
            "File (at path {}) is not a dyld shared cache file",
            path.display()
        );
        process::exit(1);
    }

    let mmap = match unsafe { memmap2::Mmap::map(&file) } {
        Ok(mmap) => mmap,
        Err(error) => {
            eprintln!(
                "Failed to map the file (at path {}), error: {}",
                path.display(),
                error
            );
            process::exit(1);
        }
    };

    let view = match DscView::parse(&mmap, DscParseOptions::empty()) {
        Ok(view) => view,
        Err(error) => {
            eprintln!(
                "Failed to parse the dyld_shared_cache file (at path {}), error: {}",
                path.display(),
                error
            );
            process::exit(1);
        }
    };

    println!(
        "The provided dyld_shared_cache file has {} images",
        view.images_count()
    );

    if ordered {
        let mut paths: Vec<&str> = (0..view.images.len())
            .map(|index| view.image_path_at(index))
            .collect();
        paths.sort_unstable();
        for (index, image_path) in paths.iter().enumerate() {
            println!("\t{}. {}", index + 1, image_path);
        }
    } else {
        for index in 0..view.images.len() {
            println!("\t{}. {}", index + 1, view.image_path_at(index));
        }
    }
}

fn map_file(path: &Path) -> memmap2::Mmap {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) => {
            eprintln!(
                "Failed to open file (at path {}), error: {}",
                path.display(),
                error
            );
            process::exit(1);
        }
    };
    match unsafe { memmap2::Mmap::map(&file) } {
        Ok(mmap) => mmap,
        Err(error) => {
            eprintln!(
                "Failed to map the file (at path {}), error: {}",
                path.display(),
                error
            );
            process::exit(1);
        }
    }
}

/// The arch of a thin mach-o, read straight from the header fields.
fn thin_arch_name(data: &[u8]) -> Option<&'static str> {
    if !tbdgen_macho::is_macho_magic(data) || data.len() < 12 {
        return None;
    }

    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let swapped = magic == 0xcefa_edfe || magic == 0xcffa_edfe;
    let read_u32 = |offset: usize| {
        let bytes = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        if swapped {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    };

    arch_name_for_cpu_type(read_u32(4), read_u32(8))
}
