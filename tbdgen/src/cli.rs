use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "tbdgen",
    disable_version_flag = true,
    about = r#"
tbdgen creates .tbd linker stubs from Mach-O dylibs and dyld shared caches.

EXAMPLES:
    # Convert a single dylib:
    tbdgen -p /usr/lib/libsqlite3.dylib -o libsqlite3.tbd

    # Extract every image of a shared cache into a directory tree:
    tbdgen -p dyld_shared_cache_arm64e -o out/

    # Extract one image by name:
    tbdgen -p dyld_shared_cache_arm64e --filter-image-filename libSystem.B.dylib -o out/

    # Convert everything below a directory:
    tbdgen -p /some/dir -r all -o out/
"#
)]
pub struct Opt {
    /// Path to a mach-o or dyld_shared_cache file to convert to a tbd file.
    #[arg(short = 'p', long = "path")]
    pub path: Option<PathBuf>,

    /// Path to an output file (or directory for recursing/dyld_shared_cache
    /// files) to write converted tbd files. Defaults to stdout.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Recurse the directory at --path and convert every Mach-O library and
    /// dyld_shared_cache found.
    #[arg(short = 'r', long = "recurse", value_enum)]
    pub recurse: Option<RecurseMode>,

    /// Print this message.
    #[arg(short = 'u', long = "usage", action = clap::ArgAction::Help)]
    pub usage: Option<bool>,

    /// Preserve the sub-directories files were found in, relative to the
    /// recurse-path, when writing out.
    #[arg(long)]
    pub preserve_subdirs: bool,

    /// Prevent overwriting of files when writing out.
    #[arg(long)]
    pub no_overwrite: bool,

    /// Replace the path-extension of provided file(s) when writing out,
    /// instead of appending .tbd.
    #[arg(long)]
    pub replace_path_extension: bool,

    /// Combine all created tbds into a single .tbd file with one trailer.
    #[arg(long)]
    pub combine_tbds: bool,

    /// Only parse the provided file(s) if they are mach-o files.
    #[arg(long, conflicts_with = "dsc")]
    pub macho: bool,

    /// Only parse the provided file(s) if they are dyld_shared_cache files.
    #[arg(long)]
    pub dsc: bool,

    /// Only extract dyld_shared_cache images inside a directory with this
    /// name.
    #[arg(long, value_name = "DIRECTORY")]
    pub filter_image_directory: Vec<String>,

    /// Only extract dyld_shared_cache images with this filename.
    #[arg(long, value_name = "FILENAME")]
    pub filter_image_filename: Vec<String>,

    /// Extract the dyld_shared_cache image with this number. Use
    /// --list-dsc-images to enumerate image numbers.
    #[arg(long, value_name = "NUMBER")]
    pub filter_image_number: Vec<u32>,

    /// Extract the dyld_shared_cache image with this exact install path.
    #[arg(long, value_name = "PATH")]
    pub image_path: Vec<String>,

    /// Version of the .tbd format to write (see --list-tbd-versions).
    #[arg(short = 'v', long = "version", value_name = "VERSION", default_value = "v2")]
    pub tbd_version: String,

    /// Ignore the allowable-clients field.
    #[arg(long)]
    pub ignore_clients: bool,

    /// Ignore the compatibility-version field.
    #[arg(long)]
    pub ignore_compatibility_version: bool,

    /// Ignore the current-version field.
    #[arg(long)]
    pub ignore_current_version: bool,

    /// Ignore the exports field.
    #[arg(long)]
    pub ignore_exports: bool,

    /// Ignore the objc-constraint field.
    #[arg(long)]
    pub ignore_objc_constraint: bool,

    /// Ignore the parent-umbrella field.
    #[arg(long)]
    pub ignore_parent_umbrella: bool,

    /// Ignore the re-exports field.
    #[arg(long)]
    pub ignore_reexports: bool,

    /// Ignore the swift-version field.
    #[arg(long)]
    pub ignore_swift_version: bool,

    /// Ignore the uuids field.
    #[arg(long)]
    pub ignore_uuids: bool,

    /// Don't treat an image without exported symbols or re-exports as a
    /// failure.
    #[arg(long)]
    pub ignore_missing_exports: bool,

    /// Ignore any warnings.
    #[arg(long)]
    pub ignore_warnings: bool,

    /// Allow all non-external symbols (not guaranteed to link at runtime).
    #[arg(long)]
    pub allow_all_private_symbols: bool,

    /// Allow non-external ordinary symbols.
    #[arg(long)]
    pub allow_private_normal_symbols: bool,

    /// Allow non-external weak symbols.
    #[arg(long)]
    pub allow_private_weak_symbols: bool,

    /// Allow non-external objc-classes and ivars.
    #[arg(long)]
    pub allow_private_objc_symbols: bool,

    /// Allow non-external objc-classes.
    #[arg(long)]
    pub allow_private_objc_classes: bool,

    /// Allow non-external objc-ivars.
    #[arg(long)]
    pub allow_private_objc_ivars: bool,

    /// Architecture(s) to add onto the architectures found for .tbd files.
    #[arg(long, value_name = "ARCH")]
    pub add_archs: Vec<String>,

    /// Architecture(s) to remove from the architectures found for .tbd files.
    #[arg(long, value_name = "ARCH")]
    pub remove_archs: Vec<String>,

    /// Architecture(s) to replace the architectures found for .tbd files.
    #[arg(long, value_name = "ARCH")]
    pub replace_archs: Vec<String>,

    /// Flag(s) to add onto the flags found for .tbd files.
    #[arg(long, value_name = "FLAG")]
    pub add_flags: Vec<String>,

    /// Flag(s) to remove from the flags found for .tbd files.
    #[arg(long, value_name = "FLAG")]
    pub remove_flags: Vec<String>,

    /// Flag(s) to replace the flags found for .tbd files.
    #[arg(long, value_name = "FLAG")]
    pub replace_flags: Vec<String>,

    /// An objc-constraint to replace the one found for .tbd files.
    #[arg(long, value_name = "CONSTRAINT")]
    pub replace_objc_constraint: Option<String>,

    /// A platform to replace the one found for .tbd files.
    #[arg(long, value_name = "PLATFORM")]
    pub replace_platform: Option<String>,

    /// A swift-version to replace the one found for .tbd files.
    #[arg(long, value_name = "VERSION")]
    pub replace_swift_version: Option<u32>,

    /// List all valid architectures for .tbd files. With --path, list the
    /// architectures of the mach-o file at that path instead.
    #[arg(long)]
    pub list_architectures: bool,

    /// List all images of the dyld_shared_cache at --path.
    #[arg(long)]
    pub list_dsc_images: bool,

    /// Order image-paths alphabetically before printing them. An image-path's
    /// listed number should not be provided for --filter-image-number.
    #[arg(long, requires = "list_dsc_images")]
    pub ordered: bool,

    /// List all valid objc-constraint values for .tbd files.
    #[arg(long)]
    pub list_objc_constraints: bool,

    /// List all valid platforms.
    #[arg(long)]
    pub list_platform: bool,

    /// List all valid flags for .tbd files.
    #[arg(long)]
    pub list_tbd_flags: bool,

    /// List all valid versions for .tbd files.
    #[arg(long)]
    pub list_tbd_versions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecurseMode {
    /// Recurse only the top-level directory.
    Once,
    /// Recurse both the top-level directory and sub-directories.
    All,
}
