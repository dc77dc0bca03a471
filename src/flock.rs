//! Advisory one-process-per-store lock.
//!
//! Two processes opening the same slot files would corrupt each other
//! silently; the store takes `<name>.lock` in its base directory before
//! touching anything else. The lock file records the holder's process ID
//! and store name so a refused open can say who is in the way. The file
//! itself is never removed — deleting it would race a concurrent acquire;
//! the OS lock dies with the file handle.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub(crate) struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Lock `<name>.lock` under `base_dir`, failing immediately if another
    /// process holds it.
    pub(crate) fn acquire(base_dir: &Path, name: &str) -> io::Result<Self> {
        let path = base_dir.join(format!("{name}.lock"));

        // Opened without truncation: on contention the previous holder's
        // record must still be readable.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if let Err(err) = lock_exclusive(&file) {
            let holder = read_holder(&mut file);
            tracing::warn!(
                store = name,
                path = %path.display(),
                holder = holder.as_deref().unwrap_or("unknown"),
                "store is already locked"
            );
            return Err(io::Error::new(
                err.kind(),
                format!(
                    "store '{name}' is locked by another process (holder: {})",
                    holder.as_deref().unwrap_or("unknown")
                ),
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{} {}", std::process::id(), name)?;
        file.flush()?;

        tracing::debug!(store = name, path = %path.display(), "acquired store lock");
        Ok(Self { _file: file, path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// `pid name` line left by the current holder, if legible.
fn read_holder(file: &mut File) -> Option<String> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    let line = content.lines().next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

// Non-blocking on every platform: a held lock is an immediate error and the
// caller reports the holder instead of waiting for it.

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let rc = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            std::ptr::null_mut(),
        )
    };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    tracing::warn!("file locking unsupported on this platform, store is unguarded");
    Ok(())
}
