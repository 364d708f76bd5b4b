use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing as log;

use crate::tooling::pbs::PbsManagerPort;
use crate::utils::cancel::Ctx;
use crate::utils::fs::Fs;

// (relative path, mode). PBS reads these directly; no CLI upsert is used.
const SECRET_FILES: &[(&str, u32)] = &[
    ("etc/proxmox-backup/shadow.json", 0o600),
    ("etc/proxmox-backup/token.shadow", 0o600),
    ("etc/proxmox-backup/tfa.json", 0o600),
];
const CONFIG_FILES: &[(&str, u32)] = &[
    ("etc/proxmox-backup/user.cfg", 0o640),
    ("etc/proxmox-backup/domains.cfg", 0o640),
    ("etc/proxmox-backup/acl.cfg", 0o640),
];

#[derive(Debug, Default)]
pub struct PbsAccessOutcome {
    pub applied: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Copy staged PBS access control files onto the system with strict modes.
/// Staged files that are absent are skipped; a post-copy listing through
/// `proxmox-backup-manager` is a best-effort sanity probe only.
pub fn apply_pbs_access_from_stage(
    ctx: &Ctx,
    manager: &dyn PbsManagerPort,
    fs: &dyn Fs,
    stage_root: &Path,
    system_root: &Path,
) -> Result<PbsAccessOutcome> {
    let mut out = PbsAccessOutcome::default();

    for (rel, mode) in SECRET_FILES.iter().chain(CONFIG_FILES.iter()) {
        if ctx.cancelled() {
            anyhow::bail!(crate::errors::Aborted("pbs access apply cancelled".into()));
        }
        let src = stage_root.join(rel);
        if !fs.exists(&src) {
            continue;
        }
        let dst = system_root.join(rel);
        if let Some(parent) = dst.parent() {
            fs.mkdir_all(parent, 0o700)?;
        }
        let data = fs.read(&src)?;
        fs.write(&dst, &data, *mode)?;
        out.applied.push(dst);
    }

    if !out.applied.is_empty() {
        match manager.list_users(ctx) {
            Ok(users) => log::debug!("pbs user listing ok after restore ({users} entries)"),
            Err(e) => {
                let w = format!("pbs user listing after restore: {e:#}");
                log::warn!("{w}");
                out.warnings.push(w);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tooling::pbs::PbsManagerCli;
    use crate::utils::fs::RealFs;
    use crate::utils::process::testing::ScriptedRunner;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn copies_with_strict_modes() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::new();
        let stage = tmp.path().join("stage");
        let root = tmp.path().join("root");

        let shadow = stage.join("etc/proxmox-backup/shadow.json");
        fs.mkdir_all(shadow.parent().unwrap(), 0o755).unwrap();
        fs.write(&shadow, b"{}", 0o644).unwrap();
        fs.write(
            &stage.join("etc/proxmox-backup/user.cfg"),
            b"user: root@pam\n",
            0o644,
        )
        .unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("proxmox-backup-manager user list", b"[]");
        let manager = PbsManagerCli::new(runner.clone());

        let out =
            apply_pbs_access_from_stage(&Ctx::background(), &manager, &fs, &stage, &root).unwrap();

        assert_eq!(out.applied.len(), 2);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let m = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
            assert_eq!(m(&root.join("etc/proxmox-backup/shadow.json")), 0o600);
            assert_eq!(m(&root.join("etc/proxmox-backup/user.cfg")), 0o640);
        }
        assert!(out.warnings.is_empty());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn sanity_probe_failure_is_only_a_warning() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::new();
        let stage = tmp.path().join("stage");
        let root = tmp.path().join("root");
        let acl = stage.join("etc/proxmox-backup/acl.cfg");
        fs.mkdir_all(acl.parent().unwrap(), 0o755).unwrap();
        fs.write(&acl, b"acl:1:/:root@pam:Admin\n", 0o644).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("proxmox-backup-manager user list", b"connection refused", 1);
        let manager = PbsManagerCli::new(runner.clone());

        let out =
            apply_pbs_access_from_stage(&Ctx::background(), &manager, &fs, &stage, &root).unwrap();
        assert_eq!(out.applied.len(), 1);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn empty_stage_skips_probe() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let manager = PbsManagerCli::new(runner.clone());
        let out = apply_pbs_access_from_stage(
            &Ctx::background(),
            &manager,
            &RealFs::new(),
            &tmp.path().join("stage"),
            &tmp.path().join("root"),
        )
        .unwrap();
        assert!(out.applied.is_empty());
        assert!(runner.calls().is_empty());
    }
}
