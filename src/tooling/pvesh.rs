use std::sync::Arc;

use anyhow::Result;

use crate::utils::cancel::Ctx;
use crate::utils::process::{CmdSpec, Runner};

pub const REQ_BINS: &[&str] = &["pvesh"];

/// One `--key value` pair; secret values are redacted in rendered
/// command lines and never reach error strings.
#[derive(Clone, Debug)]
pub struct Flag {
    pub key: String,
    pub value: String,
    pub secret: bool,
}

impl Flag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            secret: true,
        }
    }
}

pub trait PveshPort: Send + Sync {
    /// `pvesh set <path> --k v ...` — the update half of an upsert.
    fn set(&self, ctx: &Ctx, path: &str, flags: &[Flag]) -> Result<Vec<u8>>;
    /// `pvesh create <path> --k v ...` — the fallback half.
    fn create(&self, ctx: &Ctx, path: &str, flags: &[Flag]) -> Result<Vec<u8>>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct PveshCli {
    runner: Arc<DynRunner>,
}

impl PveshCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }

    fn cmd(&self, verb: &str, path: &str, flags: &[Flag]) -> CmdSpec {
        let mut spec = CmdSpec::new("pvesh").arg(verb).arg(path);
        for f in flags {
            spec = spec.arg(format!("--{}", f.key));
            spec = if f.secret {
                spec.arg_secret(f.value.clone())
            } else {
                spec.arg(f.value.clone())
            };
        }
        spec
    }
}

impl PveshPort for PveshCli {
    fn set(&self, ctx: &Ctx, path: &str, flags: &[Flag]) -> Result<Vec<u8>> {
        self.runner.run_combined(ctx, &self.cmd("set", path, flags))
    }

    fn create(&self, ctx: &Ctx, path: &str, flags: &[Flag]) -> Result<Vec<u8>> {
        self.runner
            .run_combined(ctx, &self.cmd("create", path, flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::process::testing::ScriptedRunner;

    #[test]
    fn flags_become_key_value_pairs() {
        let runner = Arc::new(ScriptedRunner::new());
        let cli = PveshCli::new(runner.clone());
        cli.set(
            &Ctx::background(),
            "/access/roles/Auditor",
            &[
                Flag::new("privs", "VM.Audit"),
                Flag::new("privs", "Sys.Audit"),
            ],
        )
        .unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls,
            vec!["pvesh set /access/roles/Auditor --privs VM.Audit --privs Sys.Audit"]
        );
    }

    #[test]
    fn secret_flag_redacted_in_render() {
        let cli = PveshCli::new(Arc::new(ScriptedRunner::new()));
        let spec = cli.cmd(
            "create",
            "/access/users",
            &[
                Flag::new("userid", "bob@pve"),
                Flag::secret("password", "p4ss"),
            ],
        );
        assert!(!spec.render().contains("p4ss"));
        assert!(spec.render().contains("--password <redacted>"));
    }
}
