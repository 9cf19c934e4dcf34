//! Write destinations: building output paths and opening them, creating
//! directory ancestors on demand.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpenFileError {
    /// The destination exists and overwriting was disallowed. The existing
    /// file has not been touched.
    #[error("a file already exists at the destination")]
    AlreadyExists,

    #[error(transparent)]
    Io(io::Error),
}

pub struct OpenedFile {
    pub file: File,
    /// The shallowest directory this open call had to create, if any. Used
    /// to undo the creation if nothing ends up being written.
    pub created_root: Option<PathBuf>,
}

/// Opens `path` for writing with truncation, creating missing ancestor
/// directories with mode 0755. With `no_overwrite`, a pre-existing file is
/// never truncated and reports [`OpenFileError::AlreadyExists`].
///
/// If the open fails after ancestors were created, the created subtree is
/// best-effort removed; failures of that cleanup are ignored since another
/// writer may already have populated the directories.
pub fn open_write_file(path: &Path, no_overwrite: bool) -> Result<OpenedFile, OpenFileError> {
    match try_open(path, no_overwrite) {
        Ok(file) => Ok(OpenedFile {
            file,
            created_root: None,
        }),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            let created_root = create_ancestors(path).map_err(OpenFileError::Io)?;
            match try_open(path, no_overwrite) {
                Ok(file) => Ok(OpenedFile { file, created_root }),
                Err(error) => {
                    if let Some(created_root) = &created_root {
                        remove_created_subtree(path, created_root);
                    }
                    Err(map_open_error(error))
                }
            }
        }
        Err(error) => Err(map_open_error(error)),
    }
}

fn try_open(path: &Path, no_overwrite: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if no_overwrite {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    options.open(path)
}

fn map_open_error(error: io::Error) -> OpenFileError {
    if error.kind() == io::ErrorKind::AlreadyExists {
        OpenFileError::AlreadyExists
    } else {
        OpenFileError::Io(error)
    }
}

/// Creates the missing ancestors of `path`, returning the shallowest newly
/// created one.
fn create_ancestors(path: &Path) -> io::Result<Option<PathBuf>> {
    let Some(parent) = path.parent() else {
        return Ok(None);
    };

    let mut missing = Vec::new();
    let mut cursor = parent;
    while !cursor.as_os_str().is_empty() && !cursor.exists() {
        missing.push(cursor.to_path_buf());
        match cursor.parent() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    if missing.is_empty() {
        return Ok(None);
    }

    let created_root = missing.last().cloned();
    for dir in missing.iter().rev() {
        match make_dir(dir) {
            Ok(()) => {}
            // Raced with another writer; that's fine.
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }
    Ok(created_root)
}

#[cfg(unix)]
fn make_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o755).create(path)
}

#[cfg(not(unix))]
fn make_dir(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new().create(path)
}

/// Removes the directories created for `path`, from the deepest ancestor up
/// to and including `created_root`. Errors (e.g. a directory that is no
/// longer empty) are ignored.
pub fn remove_created_subtree(path: &Path, created_root: &Path) {
    let mut cursor = path.parent();
    while let Some(dir) = cursor {
        let _ = fs::remove_dir(dir);
        if dir == created_root {
            break;
        }
        cursor = dir.parent();
    }
}

/// Appends `.tbd` to `path`, or swaps it for the existing extension when
/// `replace_extension` is set.
pub fn with_tbd_extension(path: &Path, replace_extension: bool) -> PathBuf {
    if replace_extension {
        return path.with_extension("tbd");
    }
    let mut name = OsString::from(path.as_os_str());
    name.push(".tbd");
    PathBuf::from(name)
}

/// The destination for one extracted image: `write_dir` + the image's
/// install path (or the suffix of it selected by a filter) + `.tbd`.
pub fn dsc_image_write_path(
    write_dir: &Path,
    image_path: &str,
    replace_extension: bool,
) -> PathBuf {
    let relative = image_path.trim_start_matches('/');
    with_tbd_extension(&write_dir.join(relative), replace_extension)
}

/// The per-cache output directory used while recursing:
/// `write_dir` [+ the cache's directory relative to the recursion root] +
/// `<cache name>.tbds`.
pub fn dsc_folder_write_path(
    write_dir: &Path,
    relative_dir: Option<&Path>,
    dsc_name: &str,
) -> PathBuf {
    let mut path = write_dir.to_path_buf();
    if let Some(relative_dir) = relative_dir {
        path.push(relative_dir);
    }
    path.push(format!("{dsc_name}.tbds"));
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn creates_missing_ancestors_with_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/c/out.tbd");

        let opened = open_write_file(&dest, false).unwrap();
        assert_eq!(opened.created_root.as_deref(), Some(dir.path().join("a").as_path()));
        assert!(dest.exists());
    }

    #[test]
    fn reuses_existing_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tbd");
        let opened = open_write_file(&dest, false).unwrap();
        assert!(opened.created_root.is_none());
    }

    #[test]
    fn no_overwrite_never_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tbd");
        {
            let mut file = File::create(&dest).unwrap();
            file.write_all(b"original contents").unwrap();
        }

        match open_write_file(&dest, true) {
            Err(OpenFileError::AlreadyExists) => {}
            other => panic!("expected AlreadyExists, got {:?}", other.err()),
        }
        assert_eq!(fs::read(&dest).unwrap(), b"original contents");
    }

    #[test]
    fn failed_open_rolls_back_created_dirs() {
        let dir = tempfile::tempdir().unwrap();
        // A final component no filesystem accepts: the ancestors get created
        // first, then the open itself fails, and the created subtree must be
        // removed again.
        let dest = dir.path().join("a/b").join("x".repeat(300) + ".tbd");

        assert!(open_write_file(&dest, false).is_err());
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn rollback_tolerates_populated_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        File::create(dir.path().join("a/b/other.tbd")).unwrap();

        remove_created_subtree(
            &dir.path().join("a/b/out.tbd"),
            &dir.path().join("a"),
        );
        // `b` holds another writer's file, so nothing could be removed; the
        // cleanup must swallow that.
        assert!(dir.path().join("a/b/other.tbd").exists());
    }

    #[test]
    fn tbd_extension_appends_or_replaces() {
        assert_eq!(
            with_tbd_extension(Path::new("/x/libA.dylib"), false),
            PathBuf::from("/x/libA.dylib.tbd")
        );
        assert_eq!(
            with_tbd_extension(Path::new("/x/libA.dylib"), true),
            PathBuf::from("/x/libA.tbd")
        );
    }

    #[test]
    fn image_write_path_keeps_tree() {
        assert_eq!(
            dsc_image_write_path(Path::new("out"), "/usr/lib/libA.dylib", false),
            PathBuf::from("out/usr/lib/libA.dylib.tbd")
        );
    }

    #[test]
    fn folder_write_path_shapes() {
        assert_eq!(
            dsc_folder_write_path(Path::new("out"), None, "dyld_shared_cache_arm64e"),
            PathBuf::from("out/dyld_shared_cache_arm64e.tbds")
        );
        assert_eq!(
            dsc_folder_write_path(
                Path::new("out"),
                Some(Path::new("System/Library")),
                "cache"
            ),
            PathBuf::from("out/System/Library/cache.tbds")
        );
    }
}
