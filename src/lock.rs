//! Host-wide lock held while `connect` runs, so two processes on one
//! machine never program the same routes and resolver.

use crate::error::{VpnError, VpnResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const LOCK_FILE_NAME: &str = "kubetun.lock";

/// Held `flock` on the lock file. Released when dropped.
pub struct HostLock {
    path: PathBuf,
    _file: File,
}

impl HostLock {
    /// Lock the default lock file.
    pub fn acquire() -> VpnResult<Self> {
        Self::acquire_at(&default_lock_path())
    }

    /// Lock `path`. Fails with [`VpnError::AlreadyConnected`] when another
    /// process holds it.
    pub fn acquire_at(path: &Path) -> VpnResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VpnError::config_with_source(format!("cannot create {}", parent.display()), e)
            })?;
        }

        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(false);
        #[cfg(unix)]
        opts.custom_flags(libc::O_CLOEXEC);
        let mut file = opts.open(path).map_err(|e| {
            VpnError::config_with_source(format!("cannot open lock file {}", path.display()), e)
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                return Err(VpnError::AlreadyConnected);
            }
        }

        // pid for whoever inspects the file
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        log::debug!("acquired {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        // the file stays; unlinking it would race with a concurrent acquire
        log::debug!("released {}", self.path.display());
    }
}

/// `$XDG_RUNTIME_DIR/kubetun.lock`, else the temp directory.
pub fn default_lock_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(LOCK_FILE_NAME)
}
