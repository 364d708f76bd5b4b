#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

use crate::utils::ids::sanitize_id;

/// Exclusive flock held for the lifetime of a restore run. The lock file
/// records the owning PID so a refused second run can name the holder.
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl RunLock {
    pub fn acquire(name: &str) -> Result<Self> {
        let (file, path) = open_lockfile(name)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                stamp_owner(&file);
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => match read_owner(&path) {
                Some(pid) => bail!(
                    "another restore run (pid {pid}) holds {}",
                    path.display()
                ),
                None => bail!("another restore run holds {}", path.display()),
            },
            Err(e) => Err(e).with_context(|| format!("flock {}", path.display())),
        }
    }
}

/// `/var/lock` when usable, the temp dir otherwise. Usability is probed by
/// opening the lock file itself rather than a separate marker.
fn open_lockfile(name: &str) -> Result<(File, PathBuf)> {
    let fname = format!("proxsave_{}.lock", sanitize_id(name));
    let mut last: Option<io::Error> = None;
    for dir in [PathBuf::from("/var/lock"), std::env::temp_dir()] {
        let path = dir.join(&fname);
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        opts.mode(0o644);
        match opts.open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::other("no lock directory")))
        .with_context(|| format!("open run lock {fname}"))
}

fn stamp_owner(mut file: &File) {
    let _ = file.set_len(0);
    let _ = writeln!(file, "{}", std::process::id());
    let _ = file.flush();
}

fn read_owner(path: &std::path::Path) -> Option<String> {
    let pid = fs::read_to_string(path).ok()?.trim().to_string();
    if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(pid)
}
