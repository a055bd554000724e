use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exclusive advisory lock that keeps a second ingest process from writing
/// the same store. Released when dropped.
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Lock `<runtime dir>/flightview/<name>.lock`
    pub fn acquire(name: &str) -> Result<Self> {
        Self::acquire_at(&lock_dir().join(format!("{}.lock", name)))
    }

    pub fn acquire_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {:?}", parent))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {:?}", path))?;

        try_lock(&file).with_context(|| {
            format!(
                "Another ingest process holds {}; only one writer may run",
                path.display()
            )
        })?;

        file.set_len(0).context("Failed to truncate lock file")?;
        writeln!(file, "{}", std::process::id()).context("Failed to write PID to lock file")?;

        info!("Acquired instance lock at {}", path.display());
        debug!("Process ID: {}", std::process::id());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // The flock goes away with the descriptor; the file is just tidied up.
        let _ = std::fs::remove_file(&self.path);
        debug!("Released instance lock at {}", self.path.display());
    }
}

fn lock_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("flightview")
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<()> {
    Ok(())
}
