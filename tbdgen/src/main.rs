mod cli;
mod dsc_extract;
mod filter;
mod job;
mod list;
mod macho_extract;
mod magic;
mod recurse;
mod writer;

use std::fs::File;
use std::process;

use clap::Parser;

use dsc_extract::{parse_dsc_for_main, DscForMainArgs, DscForMainError};
use job::{JobFlags, TbdJob};
use macho_extract::{parse_macho_for_main, MachForMainArgs};
use magic::MagicBuffer;

fn main() {
    env_logger::init();

    let opt = cli::Opt::parse();

    if opt.list_tbd_versions {
        list::print_tbd_versions();
        return;
    }
    if opt.list_tbd_flags {
        list::print_tbd_flags();
        return;
    }
    if opt.list_objc_constraints {
        list::print_objc_constraints();
        return;
    }
    if opt.list_platform {
        list::print_platforms();
        return;
    }
    if opt.list_architectures {
        list::print_architectures(opt.path.as_deref());
        return;
    }
    if opt.list_dsc_images {
        let Some(path) = &opt.path else {
            eprintln!("Please provide a path to a dyld_shared_cache file (-p/--path)");
            process::exit(1);
        };
        list::print_dsc_images(path, opt.ordered);
        return;
    }

    let mut job = match job::build_job(&opt) {
        Ok(job) => job,
        Err(message) => {
            eprintln!("{message}");
            process::exit(1);
        }
    };

    if let Some(mode) = opt.recurse {
        process::exit(recurse::recurse_directory(&mut job, mode));
    }

    convert_single_file(&mut job);
}

/// Converts the single file at the job's parse path: a shared cache if its
/// magic says so, a Mach-O otherwise.
fn convert_single_file(job: &mut TbdJob) {
    let path = job.parse_path.clone();
    let mut file = match File::open(&path) {
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
    let macho_only = job.flags.contains(JobFlags::MACHO_ONLY);
    let dsc_only = job.flags.contains(JobFlags::DSC_ONLY);

    if !macho_only {
        let mut combine_file = None;
        let result = parse_dsc_for_main(DscForMainArgs {
            job: &mut *job,
            file: &mut file,
            magic: &mut magic,
            dsc_dir_path: &path,
            dsc_name: None,
            dsc_rel_dir: None,
            combine_file: &mut combine_file,
            print_paths: false,
            verify_write_path: true,
            dont_handle_non_dsc_error: !dsc_only,
        });
        match result {
            Ok(()) => return,
            Err(DscForMainError::NotASharedCache) => {
                if dsc_only {
                    process::exit(1);
                }
                // Fall through to Mach-O handling.
            }
            Err(_) => process::exit(1),
        }
    }

    let result = parse_macho_for_main(MachForMainArgs {
        job: &mut *job,
        file: &mut file,
        magic: &mut magic,
        macho_path: &path,
        rel_path: None,
        print_paths: false,
        dont_handle_non_macho_error: false,
    });
    if result.is_err() {
        process::exit(1);
    }
}
