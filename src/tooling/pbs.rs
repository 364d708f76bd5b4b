use std::sync::Arc;

use anyhow::{Context, Result};

use crate::utils::cancel::Ctx;
use crate::utils::process::{CmdSpec, Runner};

pub const REQ_BINS: &[&str] = &["proxmox-backup-manager"];

pub trait PbsManagerPort: Send + Sync {
    /// Number of configured users; used as a post-restore sanity probe.
    fn list_users(&self, ctx: &Ctx) -> Result<usize>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct PbsManagerCli {
    runner: Arc<DynRunner>,
}

impl PbsManagerCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl PbsManagerPort for PbsManagerCli {
    fn list_users(&self, ctx: &Ctx) -> Result<usize> {
        let cmd = CmdSpec::new("proxmox-backup-manager").args([
            "user",
            "list",
            "--output-format",
            "json",
        ]);
        let out = self
            .runner
            .run_combined(ctx, &cmd)
            .context("run proxmox-backup-manager user list")?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_slice(&out).context("parse PBS user list json")?;
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::process::testing::ScriptedRunner;

    #[test]
    fn counts_users() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok(
            "proxmox-backup-manager user list",
            br#"[{"userid":"root@pam"},{"userid":"backup@pbs"}]"#,
        );
        let cli = PbsManagerCli::new(runner);
        assert_eq!(cli.list_users(&Ctx::background()).unwrap(), 2);
    }
}
