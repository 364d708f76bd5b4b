use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::utils::cancel::Ctx;
use crate::utils::process::{CmdSpec, Runner, run_text};

pub const REQ_BINS: &[&str] = &["systemctl"];

pub trait SystemdPort: Send + Sync {
    /// Schedule `sh <script>` once, `delay_secs` from now, as a transient
    /// timer named `<unit>.timer`.
    fn schedule_once(&self, ctx: &Ctx, unit: &str, delay_secs: u64, script: &Path) -> Result<()>;

    /// `systemctl is-active <unit>` output, trimmed (e.g. "active",
    /// "activating", "inactive"); a non-zero exit still yields the state.
    fn unit_state(&self, ctx: &Ctx, unit: &str) -> String;

    /// Stop the transient timer and clear a possible failed service.
    /// Best effort; the rollback marker is the real gate.
    fn cancel_timer(&self, ctx: &Ctx, unit: &str);

    fn restart(&self, ctx: &Ctx, service: &str) -> Result<()>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct SystemdCli {
    runner: Arc<DynRunner>,
}

impl SystemdCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl SystemdPort for SystemdCli {
    fn schedule_once(&self, ctx: &Ctx, unit: &str, delay_secs: u64, script: &Path) -> Result<()> {
        let cmd = CmdSpec::new("systemd-run")
            .arg(format!("--unit={unit}"))
            .arg(format!("--on-active={delay_secs}s"))
            .arg("sh")
            .arg(script.display().to_string());
        self.runner
            .run_combined(ctx, &cmd)
            .with_context(|| format!("schedule transient timer {unit}"))?;
        Ok(())
    }

    fn unit_state(&self, ctx: &Ctx, unit: &str) -> String {
        let cmd = CmdSpec::new("systemctl").args(["is-active", unit]);
        match self.runner.run_combined(ctx, &cmd) {
            Ok(out) => String::from_utf8_lossy(&out).trim().to_string(),
            Err(e) => e
                .downcast_ref::<crate::errors::CmdFailed>()
                .map(|f| f.output_text().trim().to_string())
                .unwrap_or_default(),
        }
    }

    fn cancel_timer(&self, ctx: &Ctx, unit: &str) {
        let stop = CmdSpec::new("systemctl").args(["stop", &format!("{unit}.timer")]);
        let _ = self.runner.run_combined(ctx, &stop);
        let reset = CmdSpec::new("systemctl").args(["reset-failed", &format!("{unit}.service")]);
        let _ = self.runner.run_combined(ctx, &reset);
    }

    fn restart(&self, ctx: &Ctx, service: &str) -> Result<()> {
        let cmd = CmdSpec::new("systemctl").args(["restart", service]);
        run_text(self.runner.as_ref(), ctx, &cmd)
            .with_context(|| format!("systemctl restart {service}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::process::testing::ScriptedRunner;
    use std::path::PathBuf;

    #[test]
    fn schedule_builds_transient_timer() {
        let runner = Arc::new(ScriptedRunner::new());
        let sd = SystemdCli::new(runner.clone());
        sd.schedule_once(
            &Ctx::background(),
            "proxsave-rollback-7",
            180,
            &PathBuf::from("/tmp/proxsave/x/rollback.sh"),
        )
        .unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "systemd-run --unit=proxsave-rollback-7 --on-active=180s sh /tmp/proxsave/x/rollback.sh"
            ]
        );
    }

    #[test]
    fn unit_state_survives_nonzero_exit() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("systemctl is-active", b"inactive\n", 3);
        let sd = SystemdCli::new(runner);
        assert_eq!(
            sd.unit_state(&Ctx::background(), "proxsave-rollback-7.service"),
            "inactive"
        );
    }

    #[test]
    fn cancel_timer_stops_and_resets() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("systemctl stop", b"no such unit", 4);
        let sd = SystemdCli::new(runner.clone());
        sd.cancel_timer(&Ctx::background(), "proxsave-rollback-7");
        assert_eq!(
            runner.calls(),
            vec![
                "systemctl stop proxsave-rollback-7.timer",
                "systemctl reset-failed proxsave-rollback-7.service",
            ]
        );
    }
}
