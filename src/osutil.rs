//! Filesystem helpers: writable-parent escalation, replacing rename with
//! cross-device fallback, positional I/O and metadata shims.

use filetime::{set_file_mtime, FileTime};
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Run `op` on `path`, temporarily granting the parent directory write
/// permission if it lacks it and restoring the original mode afterwards.
pub fn in_writable_dir<F>(op: F, path: &Path) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent directory"));
    };
    let meta = fs::metadata(parent)?;
    if !meta.is_dir() {
        return Err(io::Error::other("parent is not a directory"));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o200 == 0 {
            fs::set_permissions(parent, fs::Permissions::from_mode(mode | 0o700))?;
            let res = op(path);
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(mode));
            return res;
        }
    }

    op(path)
}

/// Rename `from` onto `to`, replacing `to` if it exists. Falls back to a
/// copy and delete when a direct rename is refused (cross-device moves).
pub fn rename(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        // Windows refuses to rename over an existing file.
        match fs::remove_file(to) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Create a single directory with the given mode. The parent must exist.
#[cfg(unix)]
pub fn make_dir(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(mode).create(path)
}

#[cfg(not(unix))]
pub fn make_dir(path: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir(path)
}

/// Set the permission bits on `path`.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Set the modification time on `path` to `mtime`, whole seconds since
/// the epoch. Works on the path, so a file that has already been given
/// a read-only mode can still be retimed.
pub fn set_mtime(path: &Path, mtime: i64) -> io::Result<()> {
    set_file_mtime(path, FileTime::from_unix_time(mtime, 0))
}

/// Read exactly `buf.len()` bytes from `fd` at `offset`.
#[cfg(unix)]
pub fn read_exact_at(fd: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    fd.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub fn read_exact_at(fd: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match fd.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write all of `buf` to `fd` at `offset`.
#[cfg(unix)]
pub fn write_all_at(fd: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    fd.write_all_at(buf, offset)
}

#[cfg(windows)]
pub fn write_all_at(fd: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match fd.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
