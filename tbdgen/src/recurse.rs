//! The directory walker: probes every file below the recurse-path and feeds
//! shared caches and Mach-O files to their converters.

use std::fs::File;
use std::path::Path;

use walkdir::WalkDir;

use tbdgen_macho::write_footer;

use crate::cli::RecurseMode;
use crate::dsc_extract::{parse_dsc_for_main_while_recursing, DscForMainArgs, DscForMainError};
use crate::job::{JobFlags, TbdJob};
use crate::macho_extract::{parse_macho_for_main, MachForMainArgs};
use crate::magic::MagicBuffer;

/// Walks the job's parse path, converting everything convertible. Returns
/// the process exit code.
pub fn recurse_directory(job: &mut TbdJob, mode: RecurseMode) -> i32 {
    job.flags |= JobFlags::RECURSE_DIRECTORIES;

    if job.write_path.is_none() {
        eprintln!(
            "Please provide a directory to write .tbd files created from files of the provided \
             directory: {}",
            job.parse_path.display()
        );
        return 1;
    }

    let root = job.parse_path.clone();
    let max_depth = match mode {
        RecurseMode::Once => 1,
        RecurseMode::All => usize::MAX,
    };

    // One combine-file spans every cache found below the root.
    let mut combine_file: Option<File> = None;

    for entry in WalkDir::new(&root).max_depth(max_depth).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                log::warn!("failed to recurse into {}: {error}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        convert_one_file(job, entry.path(), &root, &mut combine_file);
    }

    if let Some(mut combine_file) = combine_file.take() {
        if write_footer(&mut combine_file).is_err() {
            eprintln!(
                "Failed to write footer for combined .tbd file for files from directory (at path \
                 {})",
                root.display()
            );
            return 1;
        }
    }
    0
}

fn convert_one_file(
    job: &mut TbdJob,
    path: &Path,
    root: &Path,
    combine_file: &mut Option<File>,
) {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(error) => {
            if !job.flags.contains(JobFlags::IGNORE_WARNINGS) {
                eprintln!(
                    "Failed to open file (at path {}), error: {}",
                    path.display(),
                    error
                );
            }
            return;
        }
    };

    let mut magic = MagicBuffer::new();
    let rel_path = path.strip_prefix(root).unwrap_or(path);
    let dsc_dir_path = path.parent().unwrap_or(Path::new("."));
    let dsc_name = path.file_name().and_then(|name| name.to_str());
    let dsc_rel_dir = rel_path.parent().filter(|parent| !parent.as_os_str().is_empty());

    if !job.flags.contains(JobFlags::MACHO_ONLY) {
        let result = parse_dsc_for_main_while_recursing(DscForMainArgs {
            job: &mut *job,
            file: &mut file,
            magic: &mut magic,
            dsc_dir_path,
            dsc_name,
            dsc_rel_dir,
            combine_file,
            print_paths: true,
            verify_write_path: false,
            dont_handle_non_dsc_error: true,
        });
        match result {
            // Handled as a cache, successfully or not; either way it was
            // one, so don't retry it as a Mach-O.
            Ok(()) => return,
            Err(DscForMainError::NotASharedCache) => {}
            Err(_) => return,
        }
    }

    if job.flags.contains(JobFlags::DSC_ONLY) {
        return;
    }

    // Errors were already reported; a file that is neither format is simply
    // skipped while recursing.
    let _ = parse_macho_for_main(MachForMainArgs {
        job: &mut *job,
        file: &mut file,
        magic: &mut magic,
        macho_path: path,
        rel_path: Some(rel_path),
        print_paths: true,
        dont_handle_non_macho_error: true,
    });
}
