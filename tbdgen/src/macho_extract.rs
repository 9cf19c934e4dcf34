//! Standalone Mach-O conversion: a single dylib (thin or fat) straight to a
//! `.tbd`.

use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use tbdgen_macho::{parse_file, ImageParseError};

use crate::job::{JobFlags, TbdJob};
use crate::magic::{read_magic, MagicBuffer, ReadMagicError};
use crate::writer::{open_write_file, with_tbd_extension, OpenFileError};

#[derive(Error, Debug)]
pub enum MachForMainError {
    /// The file's magic is not a Mach-O magic.
    #[error("the file is not a mach-o")]
    NotAMachO,

    #[error("the mach-o file could not be parsed")]
    OtherError,

    #[error("the converted tbd could not be written out")]
    WriteFail,
}

pub struct MachForMainArgs<'a> {
    pub job: &'a mut TbdJob,
    pub file: &'a mut File,
    pub magic: &'a mut MagicBuffer,
    pub macho_path: &'a Path,
    /// The file's path relative to the recursion root, while recursing.
    pub rel_path: Option<&'a Path>,
    pub print_paths: bool,
    /// Suppress the "not a mach-o" message; set by probing callers.
    pub dont_handle_non_macho_error: bool,
}

pub fn parse_macho_for_main(args: MachForMainArgs<'_>) -> Result<(), MachForMainError> {
    match read_magic(args.magic, args.file) {
        Ok(()) => {}
        Err(ReadMagicError::ReadFailed(error)) => {
            eprintln!(
                "Failed to read data from file (at path {}), error: {}",
                args.macho_path.display(),
                error
            );
            return Err(MachForMainError::OtherError);
        }
        Err(ReadMagicError::NotLargeEnough) => {
            if !args.dont_handle_non_macho_error {
                eprintln!(
                    "File (at path {}) is not a mach-o file",
                    args.macho_path.display()
                );
            }
            return Err(MachForMainError::NotAMachO);
        }
    }

    if !args.magic.is_macho() {
        if !args.dont_handle_non_macho_error {
            eprintln!(
                "File (at path {}) is not a mach-o file",
                args.macho_path.display()
            );
        }
        return Err(MachForMainError::NotAMachO);
    }

    let mmap = match unsafe { memmap2::Mmap::map(&*args.file) } {
        Ok(mmap) => mmap,
        Err(error) => {
            eprintln!(
                "Failed to map the file (at path {}), error: {}",
                args.macho_path.display(),
                error
            );
            return Err(MachForMainError::OtherError);
        }
    };

    let job = &mut *args.job;
    let original = {
        let mut snapshot = job.render.clone();
        snapshot.exports = Vec::new();
        snapshot
    };

    match parse_file(&mut job.render, &mmap, job.parse_options) {
        Ok(()) => {}
        Err(ImageParseError::NoExports)
            if job.flags.contains(JobFlags::IGNORE_MISSING_EXPORTS) => {}
        Err(error) => {
            job.render.clear_for_next_image(&original);
            print_macho_error(job.flags, args.macho_path, args.print_paths, &error);
            return Err(MachForMainError::OtherError);
        }
    }

    job.field_edits.apply(&mut job.render);
    job.render.normalize();

    let result = match write_destination(job, args.rel_path) {
        Some(destination) => write_to_file(job, args.macho_path, &destination),
        None => {
            let mut out = io::stdout().lock();
            job.render
                .write_to(&mut out, job.write_options)
                .map_err(|_| MachForMainError::WriteFail)
        }
    };

    job.render.clear_for_next_image(&original);
    result
}

fn print_macho_error(flags: JobFlags, path: &Path, print_paths: bool, error: &ImageParseError) {
    if matches!(error, ImageParseError::NoExports)
        && flags.contains(JobFlags::IGNORE_WARNINGS)
        && flags.contains(JobFlags::RECURSE_DIRECTORIES)
    {
        return;
    }

    if print_paths {
        eprintln!(
            "Mach-o file (at path {}) could not be converted: {error}",
            path.display()
        );
    } else {
        eprintln!("The provided mach-o file could not be converted: {error}");
    }
}

/// Picks the destination file. `None` means stdout.
///
/// Standalone, the output path is taken as given, except that an existing
/// directory gets the source's file name (plus `.tbd`) appended. While
/// recursing, files land under the output directory at their path relative
/// to the recursion root, flattened to the bare file name unless
/// `--preserve-subdirs` is set.
fn write_destination(job: &TbdJob, rel_path: Option<&Path>) -> Option<PathBuf> {
    let write_path = job.write_path.as_deref()?;
    let replace_extension = job.flags.contains(JobFlags::REPLACE_PATH_EXTENSION);

    if let Some(rel_path) = rel_path {
        let relative = if job.flags.contains(JobFlags::PRESERVE_SUBDIRS) {
            rel_path
        } else {
            Path::new(rel_path.file_name().unwrap_or(OsStr::new("out")))
        };
        return Some(with_tbd_extension(
            &write_path.join(relative),
            replace_extension,
        ));
    }

    if write_path.is_dir() {
        let file_name = job
            .parse_path
            .file_name()
            .unwrap_or(OsStr::new("out"))
            .to_os_string();
        return Some(with_tbd_extension(
            &write_path.join(file_name),
            replace_extension,
        ));
    }

    Some(write_path.to_path_buf())
}

fn write_to_file(
    job: &TbdJob,
    macho_path: &Path,
    destination: &Path,
) -> Result<(), MachForMainError> {
    let opened = match open_write_file(destination, job.flags.contains(JobFlags::NO_OVERWRITE)) {
        Ok(opened) => opened,
        Err(OpenFileError::AlreadyExists) => {
            if !job.flags.contains(JobFlags::IGNORE_WARNINGS) {
                eprintln!(
                    "Mach-o file (at path {}) already has an existing file at its write-path \
                     that could not be overwritten. Skipping",
                    macho_path.display()
                );
            }
            return Ok(());
        }
        Err(OpenFileError::Io(error)) => {
            if !job.flags.contains(JobFlags::IGNORE_WARNINGS) {
                eprintln!(
                    "Failed to open write-file (for path: {}), error: {error}",
                    destination.display()
                );
            }
            return Err(MachForMainError::WriteFail);
        }
    };

    let mut file = opened.file;
    match job.render.write_to(&mut file, job.write_options) {
        Ok(()) => Ok(()),
        Err(error) => {
            drop(file);
            let _ = std::fs::remove_file(destination);
            if let Some(created_root) = &opened.created_root {
                crate::writer::remove_created_subtree(destination, created_root);
            }
            eprintln!(
                "Failed to write out tbd for mach-o file (at path {}), error: {error}",
                macho_path.display()
            );
            Err(MachForMainError::WriteFail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FieldEdits;
    use std::io::{Seek, SeekFrom, Write};
    use tbdgen_macho::test_fixtures::DylibFixture;
    use tbdgen_macho::{MachParseOptions, TbdRecord, TbdVersion, TbdWriteOptions};

    fn job_for(write_path: Option<PathBuf>) -> TbdJob {
        let base = TbdRecord::new(TbdVersion::V2);
        TbdJob {
            parse_path: PathBuf::from("libdemo.dylib"),
            write_path,
            filters: Vec::new(),
            numbers: Vec::new(),
            filter_paths_count: 0,
            flags: JobFlags::empty(),
            parse_options: MachParseOptions::empty(),
            write_options: TbdWriteOptions::empty(),
            field_edits: FieldEdits::default(),
            render: base.clone(),
            base,
        }
    }

    fn run(job: &mut TbdJob, bytes: &[u8]) -> Result<(), MachForMainError> {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut magic = MagicBuffer::new();
        parse_macho_for_main(MachForMainArgs {
            job,
            file: &mut file,
            magic: &mut magic,
            macho_path: Path::new("libdemo.dylib"),
            rel_path: None,
            print_paths: false,
            dont_handle_non_macho_error: true,
        })
    }

    #[test]
    fn converts_thin_dylib_to_file() {
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("libdemo.tbd");
        let mut job = job_for(Some(dest.clone()));

        let dylib = DylibFixture::new("/usr/lib/libdemo.dylib")
            .export("_demo")
            .build(0);
        run(&mut job, &dylib).unwrap();

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("install-name:    /usr/lib/libdemo.dylib"));
        assert!(text.contains("symbols:         [ _demo ]"));
        assert!(text.ends_with("...\n"));
    }

    #[test]
    fn directory_output_appends_file_name() {
        let out = tempfile::tempdir().unwrap();
        let mut job = job_for(Some(out.path().to_path_buf()));

        let dylib = DylibFixture::new("/usr/lib/libdemo.dylib")
            .export("_demo")
            .build(0);
        run(&mut job, &dylib).unwrap();

        assert!(out.path().join("libdemo.dylib.tbd").exists());
    }

    #[test]
    fn non_macho_is_distinguished() {
        let mut job = job_for(None);
        match run(&mut job, b"not a mach-o at all, for sure") {
            Err(MachForMainError::NotAMachO) => {}
            other => panic!("expected NotAMachO, got {other:?}"),
        }
    }

    #[test]
    fn render_state_restored_between_files() {
        let out = tempfile::tempdir().unwrap();
        let mut job = job_for(Some(out.path().to_path_buf()));

        let dylib = DylibFixture::new("/usr/lib/libdemo.dylib")
            .export("_demo")
            .build(0);
        run(&mut job, &dylib).unwrap();

        assert!(job.render.install_name.is_none());
        assert!(job.render.exports.is_empty());
        assert!(job.render.archs.is_empty());
    }
}
