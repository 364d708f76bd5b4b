use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::utils::ids::sanitize_id;
use crate::utils::time::current_epoch;

/// Well-known base for per-restore working directories.
pub const DEFAULT_BASE: &str = "/tmp/proxsave";

pub const REGISTRY_ENV: &str = "PROXSAVE_REGISTRY_FILE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub path: PathBuf,
    pub pid: i32,
    pub created_at: u64,
    pub purpose: String,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
}

/// Process-wide registry of temporary working directories, persisted as a
/// JSON array and reconciled across crashes via PID liveness.
#[derive(Debug)]
pub struct Registry {
    file: PathBuf,
    base: PathBuf,
}

impl Registry {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_base(path, Path::new(DEFAULT_BASE))
    }

    pub fn open_with_base(path: &Path, base: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            bail!("registry path must not be empty");
        }
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("create registry dir {}", dir.display()))?;
        }
        let reg = Self {
            file: path.to_path_buf(),
            base: base.to_path_buf(),
        };
        // Materialize an empty array so later readers never see a partial file.
        reg.with_locked(|_| Ok(()))?;
        Ok(reg)
    }

    /// Create a fresh working directory under the base and record it.
    pub fn register(&self, purpose: &str) -> Result<PathBuf> {
        let safe = sanitize_id(purpose);
        fs::create_dir_all(&self.base)
            .with_context(|| format!("create base dir {}", self.base.display()))?;

        let epoch = current_epoch();
        let pid = std::process::id() as i32;
        let mut dir = None;
        for seq in 0..10_000u32 {
            let cand = self.base.join(format!("{safe}_{epoch}_{seq}"));
            match fs::create_dir(&cand) {
                Ok(()) => {
                    dir = Some(cand);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("create {}", cand.display()));
                }
            }
        }
        let Some(dir) = dir else {
            bail!("could not find a free working directory under {}", self.base.display());
        };

        self.with_locked(|entries| {
            entries.push(Entry {
                path: dir.clone(),
                pid,
                created_at: epoch,
                purpose: purpose.to_string(),
            });
            Ok(())
        })?;
        Ok(dir)
    }

    /// Drop the entry and best-effort delete the directory.
    pub fn unregister(&self, dir: &Path) -> Result<()> {
        self.with_locked(|entries| {
            entries.retain(|e| e.path != dir);
            Ok(())
        })?;
        if dir.exists() {
            let _ = fs::remove_dir_all(dir);
        }
        Ok(())
    }

    /// Remove entries whose owning process is gone, deleting their
    /// directories. Entries of live PIDs are kept untouched.
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.with_locked(|entries| {
            entries.retain(|e| {
                if pid_alive(e.pid) {
                    report.kept += 1;
                    true
                } else {
                    let _ = fs::remove_dir_all(&e.path);
                    report.removed.push(e.path.clone());
                    false
                }
            });
            Ok(())
        })?;
        Ok(report)
    }

    pub fn entries(&self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        self.with_locked(|entries| {
            out = entries.clone();
            Ok(())
        })?;
        Ok(out)
    }

    fn with_locked(&self, f: impl FnOnce(&mut Vec<Entry>) -> Result<()>) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.file)
            .with_context(|| format!("open registry {}", self.file.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("flock registry {}", self.file.display()))?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .with_context(|| format!("read registry {}", self.file.display()))?;
        let mut entries: Vec<Entry> = if raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("parse registry {}", self.file.display()))?
        };

        let res = f(&mut entries);

        let serialized = serde_json::to_string_pretty(&entries)?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(serialized.as_bytes())
            .with_context(|| format!("write registry {}", self.file.display()))?;
        let _ = fs2::FileExt::unlock(&file);
        res
    }
}

/// Signal-0 probe; PID <= 0 is never alive.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Precedence: env override, then config, then the user state directory.
pub fn registry_path(cfg: Option<&Path>) -> PathBuf {
    resolve_registry_path(std::env::var_os(REGISTRY_ENV), cfg)
}

fn resolve_registry_path(env: Option<std::ffi::OsString>, cfg: Option<&Path>) -> PathBuf {
    if let Some(v) = env
        && !v.is_empty()
    {
        return PathBuf::from(v);
    }
    if let Some(p) = cfg {
        return p.to_path_buf();
    }
    let state_dir = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/state")))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE));
    state_dir.join("proxsave/registry.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(tmp: &TempDir) -> Registry {
        Registry::open_with_base(&tmp.path().join("state/registry.json"), &tmp.path().join("work"))
            .unwrap()
    }

    #[test]
    fn open_rejects_empty_path() {
        let err = Registry::open(Path::new("")).unwrap_err().to_string();
        assert!(err.contains("must not be empty"));
    }

    #[test]
    fn register_creates_dir_and_entry() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);

        let dir = reg.register("network apply").unwrap();
        assert!(dir.is_dir());
        let entries = reg.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, dir);
        assert_eq!(entries[0].pid, std::process::id() as i32);
        assert_eq!(entries[0].purpose, "network apply");
        // purpose is sanitized in the directory name, not in the entry
        assert!(
            dir.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("network_apply_")
        );
    }

    #[test]
    fn unregister_removes_entry_and_dir() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let dir = reg.register("stage").unwrap();

        reg.unregister(&dir).unwrap();
        assert!(!dir.exists());
        assert!(reg.entries().unwrap().is_empty());
    }

    #[test]
    fn sweep_keeps_live_pid_and_removes_dead() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let live = reg.register("live").unwrap();

        let dead_dir = tmp.path().join("work/dead_0_0");
        fs::create_dir_all(&dead_dir).unwrap();
        reg.with_locked(|entries| {
            entries.push(Entry {
                path: dead_dir.clone(),
                pid: -1,
                created_at: 0,
                purpose: "dead".into(),
            });
            Ok(())
        })
        .unwrap();

        let report = reg.sweep().unwrap();
        assert_eq!(report.kept, 1);
        assert_eq!(report.removed, vec![dead_dir.clone()]);
        assert!(!dead_dir.exists());
        assert!(live.is_dir());
    }

    #[test]
    fn pid_liveness_bounds() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(-5));
        assert!(pid_alive(std::process::id() as i32));
    }

    #[test]
    fn path_precedence() {
        let cfg = PathBuf::from("/etc/proxsave/reg.json");
        assert_eq!(
            resolve_registry_path(Some("/run/reg.json".into()), Some(&cfg)),
            PathBuf::from("/run/reg.json")
        );
        assert_eq!(resolve_registry_path(None, Some(&cfg)), cfg);
        let default = resolve_registry_path(None, None);
        assert!(default.ends_with("proxsave/registry.json"));
    }
}
