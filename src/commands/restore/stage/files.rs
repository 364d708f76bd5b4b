use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing as log;

use crate::utils::fs::Fs;

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub applied: Vec<PathBuf>,
    pub pruned: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Project `<stage_root>/<rel_dir>` onto `<system_root>/<rel_dir>`: write
/// every staged file verbatim (preserving mode), then delete files present
/// on the system but absent from the stage. An absent staged directory is
/// a no-op; in particular nothing is pruned then.
pub fn sync_dir_from_stage(
    fs: &dyn Fs,
    stage_root: &Path,
    system_root: &Path,
    rel_dir: &str,
) -> Result<SyncOutcome> {
    let staged_dir = stage_root.join(rel_dir);
    let system_dir = system_root.join(rel_dir);
    let mut out = SyncOutcome::default();

    if !fs.exists(&staged_dir) {
        return Ok(out);
    }

    let mut staged_files = Vec::new();
    collect_files(fs, &staged_dir, &mut staged_files)?;

    let mut keep: Vec<PathBuf> = Vec::new();
    for src in &staged_files {
        let rel = src
            .strip_prefix(&staged_dir)
            .expect("collected under staged dir")
            .to_path_buf();
        let dst = system_dir.join(&rel);
        keep.push(dst.clone());

        if let Some(parent) = dst.parent() {
            fs.mkdir_all(parent, 0o755)?;
        }
        let mode = file_mode(fs, src).unwrap_or(0o644);
        let data = fs.read(src)?;
        fs.write(&dst, &data, mode)?;
        out.applied.push(dst);
    }

    if fs.exists(&system_dir) {
        let mut present = Vec::new();
        collect_files(fs, &system_dir, &mut present)?;
        for p in present {
            if keep.contains(&p) {
                continue;
            }
            match fs.remove_file(&p) {
                Ok(()) => out.pruned.push(p),
                Err(e) => {
                    log::warn!("prune {}: {e:#}", p.display());
                    out.warnings.push(format!("prune {}: {e:#}", p.display()));
                }
            }
        }
    }

    Ok(out)
}

/// Regular files and symlinks, depth >= 1, recursively.
fn collect_files(fs: &dyn Fs, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs.read_dir(dir)? {
        let meta = fs.symlink_metadata(&entry)?;
        if meta.is_dir() {
            collect_files(fs, &entry, out)?;
        } else {
            out.push(entry);
        }
    }
    Ok(())
}

fn file_mode(fs: &dyn Fs, path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Some(fs.metadata(path).ok()?.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = (fs, path);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fs::RealFs;
    use tempfile::TempDir;

    fn write(fs: &dyn Fs, p: &Path, data: &[u8], mode: u32) {
        fs.mkdir_all(p.parent().unwrap(), 0o755).unwrap();
        fs.write(p, data, mode).unwrap();
    }

    #[test]
    fn writes_staged_files_and_prunes_strays() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::new();
        let stage = tmp.path().join("stage");
        let root = tmp.path().join("root");

        write(&fs, &stage.join("etc/pve/ha/resources.cfg"), b"vm: 100\n", 0o640);
        write(&fs, &stage.join("etc/pve/ha/groups.cfg"), b"group: g1\n", 0o640);
        write(&fs, &root.join("etc/pve/ha/resources.cfg"), b"old\n", 0o640);
        write(&fs, &root.join("etc/pve/ha/fence.cfg"), b"stale\n", 0o640);

        let out = sync_dir_from_stage(&fs, &stage, &root, "etc/pve/ha").unwrap();

        assert_eq!(out.applied.len(), 2);
        assert_eq!(
            std::fs::read(root.join("etc/pve/ha/resources.cfg")).unwrap(),
            b"vm: 100\n"
        );
        assert!(root.join("etc/pve/ha/groups.cfg").exists());
        assert!(!root.join("etc/pve/ha/fence.cfg").exists());
        assert_eq!(out.pruned, vec![root.join("etc/pve/ha/fence.cfg")]);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn absent_stage_dir_is_noop_and_never_prunes() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::new();
        let stage = tmp.path().join("stage");
        let root = tmp.path().join("root");
        write(&fs, &root.join("etc/pve/sdn/zones.cfg"), b"keep\n", 0o640);

        let out = sync_dir_from_stage(&fs, &stage, &root, "etc/pve/sdn").unwrap();

        assert!(out.applied.is_empty());
        assert!(out.pruned.is_empty());
        assert!(root.join("etc/pve/sdn/zones.cfg").exists());
    }

    #[test]
    fn nested_directories_are_synced() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::new();
        let stage = tmp.path().join("stage");
        let root = tmp.path().join("root");

        write(&fs, &stage.join("etc/pve/sdn/zones/z1.cfg"), b"z1", 0o600);
        write(&fs, &root.join("etc/pve/sdn/zones/z2.cfg"), b"z2", 0o600);

        let out = sync_dir_from_stage(&fs, &stage, &root, "etc/pve/sdn").unwrap();

        assert!(root.join("etc/pve/sdn/zones/z1.cfg").exists());
        assert!(!root.join("etc/pve/sdn/zones/z2.cfg").exists());
        assert_eq!(out.applied.len(), 1);
        assert_eq!(out.pruned.len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(root.join("etc/pve/sdn/zones/z1.cfg"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
