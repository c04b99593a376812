//! Resolution of download destinations
//!
//! File names can come from the server (header suggestion), so they are
//! never trusted to stay inside the chosen directory.

use crate::error::{Error, Result};
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Reduce a server-suggested name to a bare file name.
///
/// Returns `None` when nothing usable is left (empty, `..`, only separators,
/// NUL bytes).
pub fn sanitize_file_name(suggested: &str) -> Option<String> {
    if suggested.contains('\0') {
        return None;
    }
    // Servers on any platform may send either separator
    let last = suggested.rsplit(['/', '\\']).next()?.trim();
    match Path::new(last).components().next() {
        Some(Component::Normal(name)) => {
            let name = name.to_string_lossy().into_owned();
            #[cfg(windows)]
            if name.contains(':') {
                return None;
            }
            Some(name)
        }
        _ => None,
    }
}

/// Join `dir` and `file_name`, rejecting names that would leave `dir`:
/// 1. NUL bytes
/// 2. absolute paths, parent directory components, root/prefix components
/// 3. anything but exactly one normal component
///
/// Rejections are [`Error::TargetInaccessible`] with an `InvalidInput` source.
pub fn resolve_target(dir: &Path, file_name: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let invalid = |detail: String| Error::TargetInaccessible {
        path: dir.join(file_name),
        source: io::Error::new(io::ErrorKind::InvalidInput, detail),
    };

    if file_name.contains('\0') {
        return Err(invalid("file name contains NUL byte".into()));
    }

    let mut normal = None;
    for component in Path::new(file_name).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                if normal.replace(s).is_some() {
                    return Err(invalid(format!(
                        "file name {:?} must not contain directories",
                        file_name
                    )));
                }
            }
            ParentDir | RootDir | Prefix(_) => {
                return Err(invalid(format!(
                    "file name contains disallowed component: {:?}",
                    component
                )));
            }
        }
    }
    let name = normal.ok_or_else(|| invalid("empty file name".into()))?;
    Ok(dir.join(name))
}

/// Create (truncate) the destination file.
///
/// A missing directory or missing permission is reported as
/// [`Error::TargetInaccessible`].
pub fn open_target(path: &Path) -> Result<File> {
    File::create(path).map_err(|source| Error::TargetInaccessible {
        path: path.to_path_buf(),
        source,
    })
}
