//! The dyld shared cache image extraction pipeline.
//!
//! Given an open cache file and a [`TbdJob`], this module iterates the
//! cache's image table, converts every selected image to a `.tbd` document
//! and routes each document to its destination: stdout, one combined file,
//! or a tree of files under the output directory. Per-image failures never
//! abort the batch; they are printed under a once-per-cache banner and
//! summarized per filter after the loop.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use thiserror::Error;

use tbdgen_macho::{
    parse_image, write_footer, DscParseError, DscParseOptions, DscView, ImageParseError,
    TbdRecord, TbdWriteOptions,
};

use crate::filter::{
    all_filters_ok, should_parse_image, unmark_happening_filters, FilterKind, FilterStatus,
    ImageFilter,
};
use crate::job::{JobFlags, TbdJob};
use crate::magic::{read_magic, MagicBuffer, ReadMagicError};
use crate::writer::{
    dsc_folder_write_path, dsc_image_write_path, open_write_file, remove_created_subtree,
    OpenFileError,
};

/// Bit 0 of an image record's scratch byte: set once the image has been
/// extracted so a second pass skips it.
const IMAGE_PAD_ALREADY_EXTRACTED: u8 = 1 << 0;

#[derive(Error, Debug)]
pub enum DscForMainError {
    /// The file's magic is not a shared cache magic; callers may retry the
    /// file as a plain Mach-O.
    #[error("the file is not a dyld shared cache")]
    NotASharedCache,

    #[error("the dyld shared cache could not be parsed")]
    OtherError,

    #[error("failed to write the trailer of the combined .tbd file")]
    CloseCombineFileFail,
}

pub struct DscForMainArgs<'a> {
    pub job: &'a mut TbdJob,
    pub file: &'a mut File,
    pub magic: &'a mut MagicBuffer,
    /// The full cache path when standalone; the containing directory while
    /// recursing (`dsc_name` then holds the file name).
    pub dsc_dir_path: &'a Path,
    pub dsc_name: Option<&'a str>,
    /// The cache's directory relative to the recursion root, for
    /// `--preserve-subdirs`.
    pub dsc_rel_dir: Option<&'a Path>,
    /// The shared combine-file slot. While recursing, a handle opened by an
    /// earlier cache comes in here and goes back out for the next one; it is
    /// left untouched when this cache turns out not to be one.
    pub combine_file: &'a mut Option<File>,
    pub print_paths: bool,
    pub verify_write_path: bool,
    /// Suppress the "not a shared cache" message; set by probing callers
    /// that will retry the file as a Mach-O.
    pub dont_handle_non_dsc_error: bool,
}

/// Converts one shared cache standalone: verifies the write path if asked,
/// runs the iteration, and finalizes the combine-file.
pub fn parse_dsc_for_main(args: DscForMainArgs<'_>) -> Result<(), DscForMainError> {
    run(args, false)
}

/// Converts one shared cache as part of a directory walk. The combine-file
/// is not finalized here; it is handed back through the args slot so several
/// caches can fold into one `.tbd`.
pub fn parse_dsc_for_main_while_recursing(
    args: DscForMainArgs<'_>,
) -> Result<(), DscForMainError> {
    run(args, true)
}

struct IterateState<'a, 'data> {
    view: DscView<'data>,
    dsc_dir_path: &'a Path,
    dsc_name: Option<&'a str>,
    /// Where artifacts go; `None` means stdout.
    write_path: Option<PathBuf>,
    combine_file: &'a mut Option<File>,
    print_paths: bool,
    parse_all_images: bool,
    did_print_messages_header: bool,
}

impl IterateState<'_, '_> {
    fn display_path(&self) -> String {
        match self.dsc_name {
            Some(name) => format!("{}/{}", self.dsc_dir_path.display(), name),
            None => self.dsc_dir_path.display().to_string(),
        }
    }

    /// The once-per-cache banner above all warnings and errors.
    fn print_messages_header(&mut self) {
        if self.did_print_messages_header {
            return;
        }

        if self.print_paths {
            eprintln!(
                "Parsing dyld_shared_cache file (at path {}) resulted in the following warnings \
                 and errors:",
                self.display_path()
            );
        } else {
            eprintln!(
                "Parsing the provided dyld_shared_cache file resulted in the following warnings \
                 and errors:"
            );
        }

        self.did_print_messages_header = true;
    }

    fn print_write_result(&mut self, flags: JobFlags, image_path: &str, result: WriteToPathResult) {
        match result {
            WriteToPathResult::AlreadyExists => {
                if flags.contains(JobFlags::IGNORE_WARNINGS) {
                    return;
                }
                self.print_messages_header();
                eprintln!(
                    "\tImage (with path {image_path}) already has an existing file at (one of) \
                     its write-paths that could not be overwritten. Skipping"
                );
            }
            WriteToPathResult::WriteFail => {
                self.print_messages_header();
                eprintln!(
                    "\tImage (with path {image_path}) could not be parsed and written out due to \
                     a write fail"
                );
            }
        }
    }
}

enum WriteToPathResult {
    AlreadyExists,
    WriteFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    /// The destination already existed and `--no-overwrite` skipped it.
    SkippedExisting,
    Failed,
}

impl WriteOutcome {
    fn counts_as_extracted(self) -> bool {
        !matches!(self, WriteOutcome::Failed)
    }
}

fn run(args: DscForMainArgs<'_>, recursing: bool) -> Result<(), DscForMainError> {
    match read_magic(args.magic, args.file) {
        Ok(()) => {}
        Err(ReadMagicError::ReadFailed(error)) => {
            eprintln!(
                "Failed to read data from file (at path {}), error: {}",
                args.dsc_dir_path.display(),
                error
            );
            return Err(DscForMainError::OtherError);
        }
        // Too small to be a cache; the caller may still try it as a Mach-O.
        Err(ReadMagicError::NotLargeEnough) => return Err(DscForMainError::NotASharedCache),
    }

    if !args.magic.is_dsc() {
        if !args.dont_handle_non_dsc_error {
            eprintln!(
                "File (at path {}) is not a dyld shared cache file",
                args.dsc_dir_path.display()
            );
        }
        return Err(DscForMainError::NotASharedCache);
    }

    let mmap = match unsafe { memmap2::Mmap::map(&*args.file) } {
        Ok(mmap) => mmap,
        Err(error) => {
            eprintln!(
                "Failed to map the file (at path {}), error: {}",
                args.dsc_dir_path.display(),
                error
            );
            return Err(DscForMainError::OtherError);
        }
    };

    let view = match DscView::parse(&mmap, DscParseOptions::ZERO_IMAGE_PADS) {
        Ok(view) => view,
        Err(DscParseError::NotACache) => {
            if !args.dont_handle_non_dsc_error {
                eprintln!(
                    "File (at path {}) is not a dyld shared cache file",
                    args.dsc_dir_path.display()
                );
            }
            return Err(DscForMainError::NotASharedCache);
        }
        Err(error) => {
            eprintln!(
                "Failed to parse the dyld_shared_cache file (at path {}), error: {}",
                args.dsc_dir_path.display(),
                error
            );
            return Err(DscForMainError::OtherError);
        }
    };

    let job = &mut *args.job;
    let write_path = if recursing {
        // Each cache gets its own `.tbds` directory while recursing.
        if job.flags.contains(JobFlags::COMBINE_TBDS) {
            job.flags |= JobFlags::DSC_WRITE_PATH_IS_FILE;
            job.write_options |= TbdWriteOptions::IGNORE_FOOTER;
        }
        let dsc_name = args.dsc_name.unwrap_or("dyld_shared_cache");
        let rel_dir = if job.flags.contains(JobFlags::PRESERVE_SUBDIRS) {
            args.dsc_rel_dir
        } else {
            None
        };
        job.write_path
            .as_deref()
            .map(|dir| dsc_folder_write_path(dir, rel_dir, dsc_name))
    } else {
        if args.verify_write_path {
            if let Err(message) = verify_write_path(job) {
                eprintln!("{message}");
                process::exit(1);
            }
        } else if job.flags.contains(JobFlags::COMBINE_TBDS) {
            job.flags |= JobFlags::DSC_WRITE_PATH_IS_FILE;
            job.write_options |= TbdWriteOptions::IGNORE_FOOTER;
        }
        job.write_path.clone()
    };

    // UUIDs never survive extraction from a cache.
    job.write_options |= TbdWriteOptions::IGNORE_UUIDS;

    let mut state = IterateState {
        view,
        dsc_dir_path: args.dsc_dir_path,
        dsc_name: args.dsc_name,
        write_path,
        combine_file: args.combine_file,
        print_paths: args.print_paths,
        parse_all_images: true,
        did_print_messages_header: false,
    };

    run_selection(&mut state, job, recursing);

    if recursing {
        // The combine-file stays open in the caller's slot, so several
        // caches can fold into one output file.
        return Ok(());
    }

    if let Some(mut combine_file) = state.combine_file.take() {
        if write_footer(&mut combine_file).is_err() {
            if args.print_paths {
                eprintln!(
                    "Failed to write footer for combined .tbd file for files from directory (at \
                     path {})",
                    args.dsc_dir_path.display()
                );
            } else {
                eprintln!(
                    "Failed to write footer for combined .tbd file for files from directory at \
                     the provided path"
                );
            }
            return Err(DscForMainError::CloseCombineFileFail);
        }
    }
    Ok(())
}

/// Applies the selection mode: the numbers fast path, then the filtered or
/// all-images loop.
fn run_selection(state: &mut IterateState, job: &mut TbdJob, recursing: bool) {
    if !job.numbers.is_empty() {
        let numbers = job.numbers.clone();
        for number in numbers {
            let images_count = state.view.images_count();
            if number == 0 || number > images_count {
                print_number_out_of_range(state, number, images_count, recursing);
                // Keep going so every bad number gets reported.
                continue;
            }

            let index = (number - 1) as usize;
            if parse_one_image(state, job, index) {
                state.view.images[index].pad |= IMAGE_PAD_ALREADY_EXTRACTED;
            }
        }

        if job.filters.is_empty() {
            print_dsc_warnings(state, job);
            return;
        }

        // Fall through to the filtered pass; the extracted bits make it skip
        // everything the numbered pass already handled.
        state.parse_all_images = false;
    } else if !job.filters.is_empty() {
        state.parse_all_images = false;
    }

    iterate_images(state, job);
}

fn print_number_out_of_range(
    state: &IterateState,
    number: u32,
    images_count: u32,
    recursing: bool,
) {
    if recursing {
        if state.print_paths {
            eprintln!(
                "An image-number of {number} goes beyond the images-count of {images_count} the \
                 dyld_shared_cache (at path {}) has",
                state.display_path()
            );
        } else {
            eprintln!(
                "An image-number of {number} goes beyond the images-count of {images_count} the \
                 dyld_shared_cache at the provided path has"
            );
        }
    } else if state.print_paths {
        eprintln!(
            "dyld_shared_cache (at path {}) does not have an image with number {number}",
            state.display_path()
        );
    } else {
        eprintln!(
            "dyld_shared_cache at the provided path does not have an image with number {number}"
        );
    }
}

/// The main loop over the image table.
fn iterate_images(state: &mut IterateState, job: &mut TbdJob) {
    for index in 0..state.view.images.len() {
        if state.view.images[index].pad & IMAGE_PAD_ALREADY_EXTRACTED != 0 {
            continue;
        }

        // An empty image-path should never happen, but skip it regardless.
        let image_path = state.view.image_path_at(index);
        if image_path.is_empty() {
            continue;
        }

        if !state.parse_all_images && !should_parse_image(&mut job.filters, image_path) {
            continue;
        }

        if parse_one_image(state, job, index) {
            state.view.images[index].pad |= IMAGE_PAD_ALREADY_EXTRACTED;
        } else {
            // The write stage never ran for this image, so roll its filters
            // back by hand.
            unmark_happening_filters(&mut job.filters);
        }
    }

    print_dsc_warnings(state, job);
}

/// Converts a single image: parse, apply field edits, route the output,
/// restore the render state. Returns whether the image counts as extracted.
fn parse_one_image(state: &mut IterateState, job: &mut TbdJob, index: usize) -> bool {
    let image_path = state.view.image_path_at(index);
    let address = state.view.images[index].address;

    let original = {
        let mut snapshot = job.render.clone();
        snapshot.exports = Vec::new();
        snapshot
    };

    let header_offset = match state.view.file_offset_for_address(address) {
        Some(offset) => offset,
        None => {
            print_image_error(
                state,
                job.flags,
                image_path,
                &ImageParseError::UnmappedImageAddress(address),
            );
            return false;
        }
    };

    match parse_image(
        &mut job.render,
        state.view.data(),
        header_offset,
        job.parse_options,
    ) {
        Ok(()) => {}
        Err(ImageParseError::NoExports)
            if job.flags.contains(JobFlags::IGNORE_MISSING_EXPORTS) => {}
        Err(error) => {
            job.render.clear_for_next_image(&original);
            print_image_error(state, job.flags, image_path, &error);
            return false;
        }
    }

    job.field_edits.apply(&mut job.render);
    job.render.normalize();

    let extracted = write_out_record(state, job, image_path);
    job.render.clear_for_next_image(&original);
    extracted
}

fn print_image_error(
    state: &mut IterateState,
    flags: JobFlags,
    image_path: &str,
    error: &ImageParseError,
) {
    // An image without exports is only a warning, and not even that during a
    // quiet recursive walk.
    if matches!(error, ImageParseError::NoExports)
        && flags.contains(JobFlags::IGNORE_WARNINGS)
        && flags.contains(JobFlags::RECURSE_DIRECTORIES)
    {
        return;
    }

    state.print_messages_header();
    match error {
        ImageParseError::NoExports => {
            eprintln!("\tImage (with path {image_path}) has no exported symbols or re-exports");
        }
        _ => {
            eprintln!("\tImage (with path {image_path}) could not be parsed and converted: {error}");
        }
    }
}

/// The write-path router: picks destinations for the rendered record and
/// advances filter statuses according to the outcome.
fn write_out_record(state: &mut IterateState, job: &mut TbdJob, image_path: &str) -> bool {
    let TbdJob {
        filters,
        render,
        flags,
        write_options,
        write_path: job_write_path,
        ..
    } = job;
    let flags = *flags;
    let write_options = *write_options;

    // A single write file takes everything.
    if flags.contains(JobFlags::DSC_WRITE_PATH_IS_FILE) {
        if let Some(path) = job_write_path.as_deref() {
            let path = path.to_path_buf();
            let outcome = write_to_path(state, flags, write_options, render, image_path, &path);
            return finish_single_destination(filters, outcome);
        }
    }

    // No write path at all means stdout (the verification step only permits
    // this for single-image selections).
    if state.write_path.is_none() {
        let outcome = write_to_stdout(state, render, write_options, image_path);
        return finish_single_destination(filters, outcome);
    }

    if state.parse_all_images {
        let write_dir = match &state.write_path {
            Some(dir) => dir.clone(),
            None => return false,
        };
        let destination = dsc_image_write_path(
            &write_dir,
            image_path,
            flags.contains(JobFlags::REPLACE_PATH_EXTENSION),
        );
        let outcome = write_to_path(state, flags, write_options, render, image_path, &destination);
        return finish_single_destination(filters, outcome);
    }

    // One file per filter the image satisfied.
    let write_dir = match &state.write_path {
        Some(dir) => dir.clone(),
        None => return false,
    };
    let replace_extension = flags.contains(JobFlags::REPLACE_PATH_EXTENSION);
    let mut any_extracted = false;
    for index in 0..filters.len() {
        if filters[index].status != FilterStatus::Happening {
            continue;
        }

        let suffix = match filters[index].kind {
            // The full install path.
            FilterKind::Path => image_path,
            // The sub-tree from the matched directory component down, or the
            // bare file name; many images can share a basename, so later
            // filename matches overwrite earlier ones.
            FilterKind::Directory | FilterKind::Filename => {
                &image_path[filters[index].match_offset..]
            }
        };
        let destination = dsc_image_write_path(&write_dir, suffix, replace_extension);
        let outcome = write_to_path(state, flags, write_options, render, image_path, &destination);

        filters[index].status = if outcome.counts_as_extracted() {
            FilterStatus::Ok
        } else {
            FilterStatus::Found
        };
        any_extracted |= outcome.counts_as_extracted();
    }
    any_extracted
}

/// Moves every `Happening` filter to its final status after a write that was
/// not dispatched per-filter.
fn finish_single_destination(filters: &mut [ImageFilter], outcome: WriteOutcome) -> bool {
    let extracted = outcome.counts_as_extracted();
    for filter in filters.iter_mut() {
        if filter.status == FilterStatus::Happening {
            filter.status = if extracted {
                FilterStatus::Ok
            } else {
                FilterStatus::Found
            };
        }
    }
    extracted
}

/// Writes the record to one destination, going through the combine-file when
/// one is open.
fn write_to_path(
    state: &mut IterateState,
    flags: JobFlags,
    write_options: TbdWriteOptions,
    render: &TbdRecord,
    image_path: &str,
    write_path: &Path,
) -> WriteOutcome {
    let should_combine = flags.contains(JobFlags::COMBINE_TBDS);

    let combined_result = state
        .combine_file
        .as_mut()
        .map(|file| render.write_to(file, write_options));
    if let Some(result) = combined_result {
        return match result {
            Ok(()) => WriteOutcome::Written,
            Err(_) => {
                state.print_write_result(flags, image_path, WriteToPathResult::WriteFail);
                WriteOutcome::Failed
            }
        };
    }

    let opened = match open_write_file(write_path, flags.contains(JobFlags::NO_OVERWRITE)) {
        Ok(opened) => opened,
        Err(OpenFileError::AlreadyExists) => {
            state.print_write_result(flags, image_path, WriteToPathResult::AlreadyExists);
            return WriteOutcome::SkippedExisting;
        }
        Err(OpenFileError::Io(error)) => {
            if !flags.contains(JobFlags::IGNORE_WARNINGS) {
                state.print_messages_header();
                if state.print_paths {
                    eprintln!(
                        "Failed to open write-file (for path: {}), error: {error}",
                        write_path.display()
                    );
                } else {
                    eprintln!("Failed to open the provided write-file, error: {error}");
                }
            }
            return WriteOutcome::Failed;
        }
    };

    let mut file = opened.file;
    match render.write_to(&mut file, write_options) {
        Ok(()) => {
            if should_combine {
                *state.combine_file = Some(file);
            }
            WriteOutcome::Written
        }
        Err(_) => {
            // Don't leave a half-written artifact, or the directories we
            // created just for it.
            drop(file);
            let _ = std::fs::remove_file(write_path);
            if let Some(created_root) = &opened.created_root {
                remove_created_subtree(write_path, created_root);
            }
            state.print_write_result(flags, image_path, WriteToPathResult::WriteFail);
            WriteOutcome::Failed
        }
    }
}

/// Writes the record to stdout, tagged with where it came from.
fn write_to_stdout(
    state: &mut IterateState,
    render: &TbdRecord,
    write_options: TbdWriteOptions,
    image_path: &str,
) -> WriteOutcome {
    let result = {
        let mut out = io::stdout().lock();
        writeln!(out, "# dyld_shared_cache: {}", state.display_path())
            .and_then(|()| writeln!(out, "# image: {image_path}"))
            .and_then(|()| render.write_to(&mut out, write_options))
    };

    match result {
        Ok(()) => WriteOutcome::Written,
        Err(_) => {
            state.print_write_result(
                JobFlags::empty(),
                image_path,
                WriteToPathResult::WriteFail,
            );
            WriteOutcome::Failed
        }
    }
}

/// The post-iteration summary: one line per filter that never reached `Ok`.
fn print_dsc_warnings(state: &mut IterateState, job: &TbdJob) {
    if job.flags.contains(JobFlags::IGNORE_WARNINGS) {
        return;
    }
    if all_filters_ok(&job.filters) {
        return;
    }

    state.print_messages_header();
    for filter in &job.filters {
        print_missing_filter(filter, job.flags);
    }
}

fn print_missing_filter(filter: &ImageFilter, flags: JobFlags) {
    match filter.status {
        FilterStatus::NotFound => match filter.kind {
            FilterKind::Filename => eprintln!(
                "\tNo images were found that passed the provided filter (a file named: {})",
                filter.string
            ),
            FilterKind::Directory => eprintln!(
                "\tNo images were found that passed the provided filter (a directory named: {})",
                filter.string
            ),
            FilterKind::Path => eprintln!(
                "\tNo images were found with the provided path ({})",
                filter.string
            ),
        },
        FilterStatus::Found => match filter.kind {
            FilterKind::Filename => eprintln!(
                "\tAt least one image that passed the provided filter (a file named: {}) was not \
                 successfully parsed",
                filter.string
            ),
            FilterKind::Directory => eprintln!(
                "\tAt least one image that passed the provided filter (a directory named: {}) \
                 was not successfully parsed",
                filter.string
            ),
            // Only one image can correspond to a path, so the user already
            // saw its per-image error. Reportable via an opt-in knob.
            FilterKind::Path => {
                if flags.contains(JobFlags::REPORT_FOUND_PATH_FILTERS) {
                    eprintln!(
                        "\tAt least one image with the provided path ({}) was not successfully \
                         parsed",
                        filter.string
                    );
                }
            }
        },
        FilterStatus::Ok | FilterStatus::Happening => {}
    }
}

/// Checks the write path against the selection before iterating.
///
/// Stdout (no write path) and regular-file targets are only allowed when the
/// selection names exactly one image, or when combining into one file.
pub fn verify_write_path(job: &mut TbdJob) -> Result<(), String> {
    let Some(write_path) = job.write_path.clone() else {
        if job.selects_exactly_one_image() {
            return Ok(());
        }
        return Err(format!(
            "Please provide a directory to write .tbd files created from images of the \
             dyld_shared_cache file at the provided path: {}",
            job.parse_path.display()
        ));
    };

    let metadata = match std::fs::metadata(&write_path) {
        Ok(metadata) => metadata,
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
        {
            // Nothing exists there yet. Combining claims the path as the one
            // output file; a single-image selection writes it as a file too;
            // otherwise a directory gets created lazily.
            if job.flags.contains(JobFlags::COMBINE_TBDS) {
                job.flags |= JobFlags::DSC_WRITE_PATH_IS_FILE;
                job.write_options |= TbdWriteOptions::IGNORE_FOOTER;
            } else if job.selects_exactly_one_image() {
                job.flags |= JobFlags::DSC_WRITE_PATH_IS_FILE;
            }
            return Ok(());
        }
        Err(error) => {
            return Err(format!(
                "Failed to get information on object at the provided write-path ({}), error: {}",
                write_path.display(),
                error
            ));
        }
    };

    if metadata.is_file() {
        if job.flags.contains(JobFlags::COMBINE_TBDS) {
            job.flags |= JobFlags::DSC_WRITE_PATH_IS_FILE;
            job.write_options |= TbdWriteOptions::IGNORE_FOOTER;
            return Ok(());
        }
        if job.selects_exactly_one_image() {
            job.flags |= JobFlags::DSC_WRITE_PATH_IS_FILE;
            return Ok(());
        }
        return Err(
            "Writing to a regular file while parsing multiple images from a dyld_shared_cache \
             file is not supported, Please provide a directory to write all tbds to"
                .to_string(),
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FieldEdits;
    use std::fs;
    use std::io::{Seek, SeekFrom, Write as _};
    use tbdgen_macho::test_fixtures::{build_cache, DylibFixture};
    use tbdgen_macho::{MachParseOptions, TbdVersion};

    fn job_for(write_path: Option<PathBuf>) -> TbdJob {
        let base = TbdRecord::new(TbdVersion::V2);
        TbdJob {
            parse_path: PathBuf::from("test_cache"),
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

    fn three_image_cache() -> Vec<u8> {
        build_cache(&[
            (
                "/usr/lib/libA.dylib",
                DylibFixture::new("/usr/lib/libA.dylib").export("_a"),
            ),
            (
                "/usr/lib/libB.dylib",
                DylibFixture::new("/usr/lib/libB.dylib").export("_b"),
            ),
            (
                "/System/libC.dylib",
                DylibFixture::new("/System/libC.dylib").export("_c"),
            ),
        ])
    }

    fn run_standalone(
        job: &mut TbdJob,
        cache: &[u8],
        verify: bool,
    ) -> Result<(), DscForMainError> {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(cache).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut magic = MagicBuffer::new();
        let mut combine_file = None;
        parse_dsc_for_main(DscForMainArgs {
            job,
            file: &mut file,
            magic: &mut magic,
            dsc_dir_path: Path::new("test_cache"),
            dsc_name: None,
            dsc_rel_dir: None,
            combine_file: &mut combine_file,
            print_paths: false,
            verify_write_path: verify,
            dont_handle_non_dsc_error: true,
        })
    }

    fn assert_no_happening(job: &TbdJob) {
        assert!(job
            .filters
            .iter()
            .all(|filter| filter.status != FilterStatus::Happening));
    }

    #[test]
    fn all_images_into_directory_tree() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let mut job = job_for(Some(write_dir.clone()));

        run_standalone(&mut job, &three_image_cache(), false).unwrap();

        for relative in [
            "usr/lib/libA.dylib.tbd",
            "usr/lib/libB.dylib.tbd",
            "System/libC.dylib.tbd",
        ] {
            let text = fs::read_to_string(write_dir.join(relative)).unwrap();
            assert!(text.starts_with("--- !tapi-tbd-v2\n"), "{relative}: {text}");
            assert!(text.ends_with("...\n"), "{relative}: {text}");
        }
    }

    #[test]
    fn single_number_writes_one_file() {
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("out.tbd");
        let mut job = job_for(Some(dest.clone()));
        job.numbers.push(2);

        run_standalone(&mut job, &three_image_cache(), true).unwrap();

        let text = fs::read_to_string(&dest).unwrap();
        assert!(text.contains("install-name:    /usr/lib/libB.dylib"));
        assert!(!text.contains("libA.dylib"));
        assert!(text.ends_with("...\n"));
    }

    #[test]
    fn filename_filter_combines_into_one_file() {
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("out.tbd");
        let mut job = job_for(Some(dest.clone()));
        job.flags |= JobFlags::COMBINE_TBDS;
        job.filters
            .push(ImageFilter::new(FilterKind::Filename, "libA.dylib"));

        run_standalone(&mut job, &three_image_cache(), true).unwrap();

        let text = fs::read_to_string(&dest).unwrap();
        assert!(text.starts_with("--- !tapi-tbd-v2\n"));
        assert!(text.contains("/usr/lib/libA.dylib"));
        // Exactly one trailer, at the very end.
        assert_eq!(text.lines().filter(|line| *line == "...").count(), 1);
        assert!(text.ends_with("...\n"));
        assert_eq!(job.filters[0].status, FilterStatus::Ok);
        assert_no_happening(&job);
    }

    #[test]
    fn filter_miss_reports_and_writes_nothing() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let mut job = job_for(Some(write_dir.clone()));
        job.filters
            .push(ImageFilter::new(FilterKind::Directory, "private"));

        run_standalone(&mut job, &three_image_cache(), false).unwrap();

        assert!(!write_dir.exists());
        assert_eq!(job.filters[0].status, FilterStatus::NotFound);
        assert_no_happening(&job);
    }

    #[test]
    fn no_overwrite_leaves_existing_artifacts_alone() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let cache = three_image_cache();

        let mut first = job_for(Some(write_dir.clone()));
        run_standalone(&mut first, &cache, false).unwrap();

        let target = write_dir.join("usr/lib/libA.dylib.tbd");
        fs::write(&target, "sentinel, not a tbd").unwrap();

        let mut second = job_for(Some(write_dir.clone()));
        second.flags |= JobFlags::NO_OVERWRITE;
        run_standalone(&mut second, &cache, false).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "sentinel, not a tbd");
    }

    #[test]
    fn non_dsc_magic_is_distinguished() {
        let dylib = DylibFixture::new("/usr/lib/libA.dylib").export("_a").build(0);
        let mut job = job_for(None);
        match run_standalone(&mut job, &dylib, false) {
            Err(DscForMainError::NotASharedCache) => {}
            other => panic!("expected NotASharedCache, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_number_is_reported_and_skipped() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let mut job = job_for(Some(write_dir.clone()));
        job.numbers.push(7);

        run_standalone(&mut job, &three_image_cache(), false).unwrap();
        assert!(!write_dir.exists());
    }

    #[test]
    fn last_image_number_is_valid() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let mut job = job_for(Some(write_dir.clone()));
        job.numbers.push(3);

        run_standalone(&mut job, &three_image_cache(), false).unwrap();
        assert!(write_dir.join("System/libC.dylib.tbd").exists());
    }

    #[test]
    fn numbers_then_filters_run_as_two_passes() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let mut job = job_for(Some(write_dir.clone()));
        job.numbers.push(1);
        job.filters
            .push(ImageFilter::new(FilterKind::Filename, "libB.dylib"));

        run_standalone(&mut job, &three_image_cache(), false).unwrap();

        // The numbered pass wrote libA under its install path; the filtered
        // pass wrote libB under its basename.
        assert!(write_dir.join("usr/lib/libA.dylib.tbd").exists());
        assert!(write_dir.join("libB.dylib.tbd").exists());
        assert_eq!(job.filters[0].status, FilterStatus::Ok);
    }

    #[test]
    fn directory_filter_preserves_subtree() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let mut job = job_for(Some(write_dir.clone()));
        job.filters
            .push(ImageFilter::new(FilterKind::Directory, "lib"));

        run_standalone(&mut job, &three_image_cache(), false).unwrap();

        assert!(write_dir.join("lib/libA.dylib.tbd").exists());
        assert!(write_dir.join("lib/libB.dylib.tbd").exists());
        assert!(!write_dir.join("lib/libC.dylib.tbd").exists());
        assert_eq!(job.filters[0].status, FilterStatus::Ok);
    }

    #[test]
    fn empty_image_path_is_skipped() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let mut job = job_for(Some(write_dir.clone()));

        let cache = build_cache(&[
            ("", DylibFixture::new("/usr/lib/libX.dylib").export("_x")),
            (
                "/usr/lib/libA.dylib",
                DylibFixture::new("/usr/lib/libA.dylib").export("_a"),
            ),
        ]);
        run_standalone(&mut job, &cache, false).unwrap();

        assert!(write_dir.join("usr/lib/libA.dylib.tbd").exists());
        // Only the one artifact; the nameless image produced nothing.
        assert_eq!(
            walk_count(&write_dir),
            1,
            "expected exactly one artifact under {}",
            write_dir.display()
        );
    }

    fn walk_count(dir: &Path) -> usize {
        let mut count = 0;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    pending.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn parse_failure_rolls_matched_filter_back() {
        let out = tempfile::tempdir().unwrap();
        let write_dir = out.path().join("out");
        let mut job = job_for(Some(write_dir.clone()));
        job.filters
            .push(ImageFilter::new(FilterKind::Filename, "libEmpty.dylib"));

        // The image matches the filter but has nothing to export, so the
        // conversion fails and the filter must end up back at NotFound, not
        // stuck at Happening.
        let cache = build_cache(&[(
            "/usr/lib/libEmpty.dylib",
            DylibFixture::new("/usr/lib/libEmpty.dylib"),
        )]);
        run_standalone(&mut job, &cache, false).unwrap();

        assert!(!write_dir.exists());
        assert_eq!(job.filters[0].status, FilterStatus::NotFound);
    }

    #[test]
    fn verify_rejects_stdout_for_multiple_images() {
        let mut job = job_for(None);
        assert!(verify_write_path(&mut job).is_err());

        job.numbers.push(1);
        assert!(verify_write_path(&mut job).is_ok());

        job.numbers.push(2);
        assert!(verify_write_path(&mut job).is_err());
    }

    #[test]
    fn verify_rejects_regular_file_for_multiple_images() {
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("existing.tbd");
        fs::write(&dest, "").unwrap();

        let mut job = job_for(Some(dest.clone()));
        assert!(verify_write_path(&mut job).is_err());

        let mut combining = job_for(Some(dest));
        combining.flags |= JobFlags::COMBINE_TBDS;
        assert!(verify_write_path(&mut combining).is_ok());
        assert!(combining.flags.contains(JobFlags::DSC_WRITE_PATH_IS_FILE));
        assert!(combining
            .write_options
            .contains(TbdWriteOptions::IGNORE_FOOTER));
    }

    #[test]
    fn verify_allows_directory_for_everything() {
        let out = tempfile::tempdir().unwrap();
        let mut job = job_for(Some(out.path().to_path_buf()));
        assert!(verify_write_path(&mut job).is_ok());
        assert!(!job.flags.contains(JobFlags::DSC_WRITE_PATH_IS_FILE));
    }
}
