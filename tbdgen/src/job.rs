//! The per-invocation conversion spec: what to parse, how to render it, and
//! where to write it.

use std::path::PathBuf;

use bitflags::bitflags;

use tbdgen_macho::{
    is_known_arch_name, MachParseOptions, ObjcConstraint, Platform, TbdFlags, TbdRecord,
    TbdVersion, TbdWriteOptions,
};

use crate::cli::Opt;
use crate::filter::{FilterKind, ImageFilter};

bitflags! {
    #[derive(Default)]
    pub struct JobFlags: u32 {
        const RECURSE_DIRECTORIES = 1 << 0;
        const NO_OVERWRITE = 1 << 1;
        const COMBINE_TBDS = 1 << 2;
        const IGNORE_WARNINGS = 1 << 3;
        const PRESERVE_SUBDIRS = 1 << 4;
        const REPLACE_PATH_EXTENSION = 1 << 5;
        const IGNORE_MISSING_EXPORTS = 1 << 6;
        /// The write path names a single file that all selected images are
        /// written into.
        const DSC_WRITE_PATH_IS_FILE = 1 << 7;
        /// Also report path filters that matched an image which then failed
        /// to convert. Off by default; the per-image error already names the
        /// path.
        const REPORT_FOUND_PATH_FILTERS = 1 << 8;
        /// `--macho`: only parse files that are Mach-O.
        const MACHO_ONLY = 1 << 9;
        /// `--dsc`: only parse files that are shared caches.
        const DSC_ONLY = 1 << 10;
    }
}

/// User-requested edits applied to the render state after parsing, before
/// serialization.
#[derive(Debug, Clone, Default)]
pub struct FieldEdits {
    pub add_archs: Vec<String>,
    pub remove_archs: Vec<String>,
    pub replace_archs: Vec<String>,
    pub add_flags: TbdFlags,
    pub remove_flags: TbdFlags,
    pub replace_flags: Option<TbdFlags>,
    pub replace_objc_constraint: Option<ObjcConstraint>,
    pub replace_platform: Option<Platform>,
    pub replace_swift_version: Option<u32>,
}

impl FieldEdits {
    pub fn is_empty(&self) -> bool {
        self.add_archs.is_empty()
            && self.remove_archs.is_empty()
            && self.replace_archs.is_empty()
            && self.add_flags.is_empty()
            && self.remove_flags.is_empty()
            && self.replace_flags.is_none()
            && self.replace_objc_constraint.is_none()
            && self.replace_platform.is_none()
            && self.replace_swift_version.is_none()
    }

    pub fn apply(&self, record: &mut TbdRecord) {
        if self.is_empty() {
            return;
        }

        if !self.replace_archs.is_empty() {
            record.archs = self.replace_archs.clone();
            for group in &mut record.exports {
                group.archs = self.replace_archs.clone();
            }
        }
        for arch in &self.add_archs {
            record.archs.push(arch.clone());
            for group in &mut record.exports {
                group.archs.push(arch.clone());
            }
        }
        if !self.remove_archs.is_empty() {
            record.archs.retain(|arch| !self.remove_archs.contains(arch));
            for group in &mut record.exports {
                group.archs.retain(|arch| !self.remove_archs.contains(arch));
            }
        }

        if let Some(flags) = self.replace_flags {
            record.flags = flags;
        }
        record.flags |= self.add_flags;
        record.flags &= !self.remove_flags;

        if let Some(constraint) = self.replace_objc_constraint {
            record.objc_constraint = Some(constraint);
        }
        if let Some(platform) = self.replace_platform {
            record.platform = Some(platform);
        }
        if let Some(version) = self.replace_swift_version {
            record.swift_version = Some(version);
        }
    }
}

/// Everything one invocation needs to convert its inputs.
#[derive(Debug)]
pub struct TbdJob {
    pub parse_path: PathBuf,
    pub write_path: Option<PathBuf>,
    pub filters: Vec<ImageFilter>,
    pub numbers: Vec<u32>,
    /// Count of `FilterKind::Path` entries in `filters`.
    pub filter_paths_count: usize,
    pub flags: JobFlags,
    pub parse_options: MachParseOptions,
    pub write_options: TbdWriteOptions,
    pub field_edits: FieldEdits,
    /// The user-seeded render state every image starts from.
    pub base: TbdRecord,
    /// The render state the image parser populates in place.
    pub render: TbdRecord,
}

impl TbdJob {
    /// Count of filters that are not exact-path filters.
    pub fn non_path_filters_count(&self) -> usize {
        self.filters.len() - self.filter_paths_count
    }

    /// True when the selection names exactly one image, which permits
    /// writing to stdout or a single regular file.
    pub fn selects_exactly_one_image(&self) -> bool {
        if self.non_path_filters_count() != 0 {
            return false;
        }
        (self.numbers.is_empty() && self.filter_paths_count == 1)
            || (self.filter_paths_count == 0 && self.numbers.len() == 1)
    }
}

/// Builds the job from parsed arguments, validating everything clap cannot.
pub fn build_job(opt: &Opt) -> Result<TbdJob, String> {
    let parse_path = opt
        .path
        .clone()
        .ok_or_else(|| "Please provide a path to a file to parse (-p/--path)".to_string())?;

    let version = TbdVersion::from_name(&opt.tbd_version).ok_or_else(|| {
        format!(
            "Unrecognized tbd-version: {}. Use --list-tbd-versions to see all valid versions",
            opt.tbd_version
        )
    })?;

    let mut filters = Vec::new();
    for path in &opt.image_path {
        filters.push(ImageFilter::new(FilterKind::Path, path));
    }
    let filter_paths_count = filters.len();
    for directory in &opt.filter_image_directory {
        filters.push(ImageFilter::new(FilterKind::Directory, directory));
    }
    for filename in &opt.filter_image_filename {
        filters.push(ImageFilter::new(FilterKind::Filename, filename));
    }

    let mut numbers = Vec::new();
    for &number in &opt.filter_image_number {
        if number == 0 {
            return Err("Image numbers are 1-based; 0 is not a valid image number".to_string());
        }
        numbers.push(number);
    }

    let mut flags = JobFlags::empty();
    if opt.recurse.is_some() {
        flags |= JobFlags::RECURSE_DIRECTORIES;
    }
    if opt.no_overwrite {
        flags |= JobFlags::NO_OVERWRITE;
    }
    if opt.combine_tbds {
        flags |= JobFlags::COMBINE_TBDS;
    }
    if opt.ignore_warnings {
        flags |= JobFlags::IGNORE_WARNINGS;
    }
    if opt.preserve_subdirs {
        flags |= JobFlags::PRESERVE_SUBDIRS;
    }
    if opt.replace_path_extension {
        flags |= JobFlags::REPLACE_PATH_EXTENSION;
    }
    if opt.ignore_missing_exports {
        flags |= JobFlags::IGNORE_MISSING_EXPORTS;
    }
    if opt.macho {
        flags |= JobFlags::MACHO_ONLY;
    }
    if opt.dsc {
        flags |= JobFlags::DSC_ONLY;
    }

    let mut parse_options = MachParseOptions::empty();
    if opt.allow_all_private_symbols {
        parse_options = MachParseOptions::allow_all_private_symbols();
    }
    if opt.allow_private_normal_symbols {
        parse_options |= MachParseOptions::ALLOW_PRIVATE_NORMAL_SYMBOLS;
    }
    if opt.allow_private_weak_symbols {
        parse_options |= MachParseOptions::ALLOW_PRIVATE_WEAK_SYMBOLS;
    }
    if opt.allow_private_objc_symbols {
        parse_options |= MachParseOptions::allow_private_objc_symbols();
    }
    if opt.allow_private_objc_classes {
        parse_options |= MachParseOptions::ALLOW_PRIVATE_OBJC_CLASSES;
    }
    if opt.allow_private_objc_ivars {
        parse_options |= MachParseOptions::ALLOW_PRIVATE_OBJC_IVARS;
    }

    let mut write_options = TbdWriteOptions::empty();
    if opt.ignore_clients {
        write_options |= TbdWriteOptions::IGNORE_CLIENTS;
    }
    if opt.ignore_compatibility_version {
        write_options |= TbdWriteOptions::IGNORE_COMPATIBILITY_VERSION;
    }
    if opt.ignore_current_version {
        write_options |= TbdWriteOptions::IGNORE_CURRENT_VERSION;
    }
    if opt.ignore_exports {
        write_options |= TbdWriteOptions::IGNORE_EXPORTS;
    }
    if opt.ignore_objc_constraint {
        write_options |= TbdWriteOptions::IGNORE_OBJC_CONSTRAINT;
    }
    if opt.ignore_parent_umbrella {
        write_options |= TbdWriteOptions::IGNORE_PARENT_UMBRELLA;
    }
    if opt.ignore_reexports {
        write_options |= TbdWriteOptions::IGNORE_REEXPORTS;
    }
    if opt.ignore_swift_version {
        write_options |= TbdWriteOptions::IGNORE_SWIFT_VERSION;
    }
    if opt.ignore_uuids {
        write_options |= TbdWriteOptions::IGNORE_UUIDS;
    }

    let field_edits = FieldEdits {
        add_archs: validated_archs(&opt.add_archs)?,
        remove_archs: validated_archs(&opt.remove_archs)?,
        replace_archs: validated_archs(&opt.replace_archs)?,
        add_flags: parsed_flags(&opt.add_flags)?,
        remove_flags: parsed_flags(&opt.remove_flags)?,
        replace_flags: if opt.replace_flags.is_empty() {
            None
        } else {
            Some(parsed_flags(&opt.replace_flags)?)
        },
        replace_objc_constraint: opt
            .replace_objc_constraint
            .as_deref()
            .map(|name| {
                ObjcConstraint::from_name(name).ok_or_else(|| {
                    format!(
                        "Unrecognized objc-constraint: {name}. Use --list-objc-constraints to \
                         see all valid values"
                    )
                })
            })
            .transpose()?,
        replace_platform: opt
            .replace_platform
            .as_deref()
            .map(|name| {
                Platform::from_name(name).ok_or_else(|| {
                    format!("Unrecognized platform: {name}. Use --list-platform to see all valid values")
                })
            })
            .transpose()?,
        replace_swift_version: opt.replace_swift_version,
    };

    let base = TbdRecord::new(version);
    let render = base.clone();

    Ok(TbdJob {
        parse_path,
        write_path: opt.output.clone(),
        filters,
        numbers,
        filter_paths_count,
        flags,
        parse_options,
        write_options,
        field_edits,
        base,
        render,
    })
}

fn validated_archs(names: &[String]) -> Result<Vec<String>, String> {
    for name in names {
        if !is_known_arch_name(name) {
            return Err(format!(
                "Unrecognized architecture: {name}. Use --list-architectures to see all valid \
                 architectures"
            ));
        }
    }
    Ok(names.to_vec())
}

fn parsed_flags(names: &[String]) -> Result<TbdFlags, String> {
    let mut flags = TbdFlags::empty();
    for name in names {
        let flag = TbdFlags::from_name(name).ok_or_else(|| {
            format!("Unrecognized tbd-flag: {name}. Use --list-tbd-flags to see all valid flags")
        })?;
        flags |= flag;
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbdgen_macho::ExportGroup;

    #[test]
    fn field_edits_replace_and_trim() {
        let mut record = TbdRecord::new(TbdVersion::V2);
        record.archs = vec!["arm64".into(), "armv7".into()];
        record.flags = TbdFlags::FLAT_NAMESPACE;
        let mut group = ExportGroup::new("arm64");
        group.symbols.push("_x".into());
        record.exports.push(group);

        let edits = FieldEdits {
            remove_archs: vec!["armv7".into()],
            add_flags: TbdFlags::NOT_APP_EXTENSION_SAFE,
            remove_flags: TbdFlags::FLAT_NAMESPACE,
            replace_platform: Some(Platform::MacOsx),
            ..Default::default()
        };
        edits.apply(&mut record);

        assert_eq!(record.archs, vec!["arm64".to_string()]);
        assert_eq!(record.flags, TbdFlags::NOT_APP_EXTENSION_SAFE);
        assert_eq!(record.platform, Some(Platform::MacOsx));
    }

    #[test]
    fn selection_cardinality() {
        let mut job = TbdJob {
            parse_path: PathBuf::from("cache"),
            write_path: None,
            filters: vec![ImageFilter::new(FilterKind::Path, "/usr/lib/liba.dylib")],
            numbers: Vec::new(),
            filter_paths_count: 1,
            flags: JobFlags::empty(),
            parse_options: MachParseOptions::empty(),
            write_options: TbdWriteOptions::empty(),
            field_edits: FieldEdits::default(),
            base: TbdRecord::default(),
            render: TbdRecord::default(),
        };
        assert!(job.selects_exactly_one_image());

        job.numbers.push(2);
        assert!(!job.selects_exactly_one_image());

        job.filters.clear();
        job.filter_paths_count = 0;
        assert!(job.selects_exactly_one_image());

        job.filters
            .push(ImageFilter::new(FilterKind::Filename, "libc.dylib"));
        assert!(!job.selects_exactly_one_image());
    }
}
