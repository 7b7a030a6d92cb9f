//! File locking and pid liveness primitives.
//!
//! The store serializes check-and-set sequences with an exclusive
//! `flock` on a per-bundle lock file. The lock is advisory and released
//! by the OS when the file descriptor closes, so a crashed holder can
//! never wedge the bundle.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// RAII guard for an exclusively-held file lock.
///
/// The lock is released when the guard is dropped: closing the file
/// descriptor releases the underlying `flock`.
#[derive(Debug)]
pub struct FileLockGuard {
    _file: File,
}

/// Acquire an exclusive lock, blocking until it is available.
///
/// Critical sections guarded by this lock are single check-and-set
/// sequences, never a sandbox run, so blocking is bounded in practice.
pub fn lock_exclusive(path: &Path) -> io::Result<FileLockGuard> {
    let file = open_lock_file(path)?;
    flock(&file, false)?;
    Ok(FileLockGuard { _file: file })
}

/// Try to acquire an exclusive lock without blocking.
///
/// Returns `Ok(None)` if another process holds the lock.
pub fn try_lock_exclusive(path: &Path) -> io::Result<Option<FileLockGuard>> {
    let file = open_lock_file(path)?;
    match flock(&file, true) {
        Ok(()) => Ok(Some(FileLockGuard { _file: file })),
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK) =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

#[cfg(unix)]
fn flock(file: &File, nonblocking: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let mut operation = libc::LOCK_EX;
    if nonblocking {
        operation |= libc::LOCK_NB;
    }
    // SAFETY: flock is a standard POSIX call and the fd is owned by `file`.
    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _nonblocking: bool) -> io::Result<()> {
    Ok(())
}

/// Check whether a given pid is alive.
///
/// Uses `kill(pid, 0)`, which probes for process existence without
/// sending a signal. `EPERM` means the process exists but belongs to
/// another user; stale-lease detection must treat that as alive.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: kill with signal 0 only checks for process existence.
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
