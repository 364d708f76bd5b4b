use std::fs::{self, Metadata, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Filesystem seam. Production uses [`RealFs`]; tests run [`RealFs`]
/// against tempdir roots so every path stays sandboxed.
pub trait Fs: Send + Sync {
    fn metadata(&self, path: &Path) -> Result<Metadata>;
    fn symlink_metadata(&self, path: &Path) -> Result<Metadata>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8], mode: u32) -> Result<()>;
    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()>;
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
    fn hard_link(&self, src: &Path, dst: &Path) -> Result<()>;
    /// Best effort; failure is ignored by callers restoring archives.
    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;
    /// Best effort mtime restore.
    fn set_times(&self, path: &Path, mtime_secs: i64) -> Result<()>;

    fn exists(&self, path: &Path) -> bool {
        self.symlink_metadata(path).is_ok()
    }
}

#[derive(Default, Clone)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl Fs for RealFs {
    fn metadata(&self, path: &Path) -> Result<Metadata> {
        fs::metadata(path).with_context(|| format!("stat {}", path.display()))
    }

    fn symlink_metadata(&self, path: &Path) -> Result<Metadata> {
        fs::symlink_metadata(path).with_context(|| format!("lstat {}", path.display()))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("read {}", path.display()))
    }

    fn write(&self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        let mut f = opts
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        f.write_all(data)
            .with_context(|| format!("write {}", path.display()))?;
        // An existing file keeps its old mode; enforce the requested one.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", path.display()))?;
        }
        Ok(())
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()> {
        if path.as_os_str().is_empty() || path.is_dir() {
            return Ok(());
        }
        let mut b = fs::DirBuilder::new();
        b.recursive(true);
        #[cfg(unix)]
        b.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        b.create(path)
            .with_context(|| format!("mkdir -p {}", path.display()))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for e in fs::read_dir(path).with_context(|| format!("readdir {}", path.display()))? {
            out.push(e?.path());
        }
        out.sort();
        Ok(out)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("unlink {}", path.display()))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path).with_context(|| format!("rm -r {}", path.display()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)
            .with_context(|| format!("rename {} -> {}", from.display(), to.display()))
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, link)
                .with_context(|| format!("symlink {} -> {}", link.display(), target.display()))
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("symlinks unsupported on this platform");
        }
    }

    fn hard_link(&self, src: &Path, dst: &Path) -> Result<()> {
        fs::hard_link(src, dst)
            .with_context(|| format!("link {} -> {}", dst.display(), src.display()))
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::unistd::{Gid, Uid, chown};
            chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .with_context(|| format!("chown {}", path.display()))?;
        }
        #[cfg(not(unix))]
        let _ = (path, uid, gid);
        Ok(())
    }

    fn set_times(&self, path: &Path, mtime_secs: i64) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::stat::utimes;
            use nix::sys::time::TimeVal;
            let tv = TimeVal::new(mtime_secs, 0);
            utimes(path, &tv, &tv).with_context(|| format!("utimes {}", path.display()))?;
        }
        #[cfg(not(unix))]
        let _ = (path, mtime_secs);
        Ok(())
    }
}
