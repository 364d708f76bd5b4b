use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing as log;

use crate::commands::restore::categories::SystemType;
use crate::commands::restore::health::{HealthOptions, run_health_checks};
use crate::commands::restore::network::diag::{
    SnapshotLabel, primary_ip, primary_ip_from_snapshot, write_snapshot,
};
use crate::commands::restore::network::rollback::RollbackEngine;
use crate::commands::restore::stage::files;
use crate::errors::{NotCommitted, PreflightFailed};
use crate::tooling::ifupdown::IfupdownPort;
use crate::tooling::systemd::SystemdPort;
use crate::ui::{CommitDecision, CommitRequest, RestoreUi};
use crate::utils::cancel::Ctx;
use crate::utils::clock::Clock;
use crate::utils::fs::Fs;
use crate::utils::process::{CmdSpec, Runner, run_text};

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NetworkApplyDeps<'a> {
    pub runner: &'a dyn Runner,
    pub fs: &'a dyn Fs,
    pub clock: &'a dyn Clock,
    pub systemd: &'a dyn SystemdPort,
    pub ifupdown: &'a dyn IfupdownPort,
    /// `/` in production; tests point it into a tempdir.
    pub system_root: &'a Path,
}

pub struct NetworkApplyRequest<'a> {
    /// Snapshot the armed timer restores (network tree and companions).
    pub rollback_backup: &'a Path,
    /// Network-only snapshot for the immediate pre-reload rollback.
    pub network_rollback: &'a Path,
    /// Staged-files mode: write `<stage_root>/etc/network` first.
    pub stage_root: Option<&'a Path>,
    pub archive_path: &'a Path,
    /// Rollback window.
    pub timeout: Duration,
    pub system_type: SystemType,
    /// Diagnostics and rollback artifacts land here.
    pub work_dir: &'a Path,
    pub health_options: HealthOptions,
}

/// Safe live-apply of the restored network configuration:
/// diagnose, stage, preflight, arm the rollback timer, reload, probe,
/// then hold the change open until the operator commits. Every non-commit
/// outcome leaves the timer armed on purpose.
pub fn apply_network_with_rollback(
    ctx: &Ctx,
    ui: &dyn RestoreUi,
    deps: &NetworkApplyDeps<'_>,
    req: &NetworkApplyRequest<'_>,
) -> Result<()> {
    let engine = RollbackEngine {
        runner: deps.runner,
        fs: deps.fs,
        clock: deps.clock,
        systemd: deps.systemd,
    };

    let before_path = write_snapshot(
        ctx,
        deps.runner,
        deps.fs,
        deps.ifupdown,
        SnapshotLabel::Before,
        req.work_dir,
        deps.system_root,
    )?;
    let before_text = deps
        .fs
        .read(&before_path)
        .map(|d| String::from_utf8_lossy(&d).into_owned())
        .unwrap_or_default();

    let mut staged_written = false;
    if let Some(stage_root) = req.stage_root {
        let out = files::sync_dir_from_stage(deps.fs, stage_root, deps.system_root, "etc/network")
            .context("write staged network files")?;
        staged_written = !out.applied.is_empty() || !out.pruned.is_empty();
        log::info!(
            "staged network files written ({} applied, {} pruned)",
            out.applied.len(),
            out.pruned.len()
        );
    }

    let nic_repair = ui
        .repair_nic_names(req.archive_path)
        .context("nic name repair")?;

    let preflight = deps
        .ifupdown
        .preflight(&Ctx::with_timeout(ctx, PREFLIGHT_TIMEOUT));
    let preflight_path = req
        .work_dir
        .join(format!("preflight_{}.txt", deps.clock.epoch()));
    let _ = deps
        .fs
        .write(&preflight_path, preflight.render().as_bytes(), 0o600);
    if preflight.skipped {
        log::warn!(
            "network preflight skipped: {}",
            preflight.skip_reason.as_deref().unwrap_or("unknown")
        );
    } else if !preflight.ok() {
        let detail = preflight
            .exit_error
            .clone()
            .unwrap_or_else(|| "validator rejected configuration".to_string());
        if staged_written {
            // the bad config is already on disk; restore the snapshot now,
            // before anything reloads it
            let rollback_log = engine
                .rollback_now(ctx, req.network_rollback, req.work_dir)
                .context("immediate network rollback")?;
            let _ = write_snapshot(
                ctx,
                deps.runner,
                deps.fs,
                deps.ifupdown,
                SnapshotLabel::AfterRollback,
                req.work_dir,
                deps.system_root,
            );
            return Err(anyhow!(PreflightFailed {
                tool: preflight.tool,
                detail,
                rollback_log: Some(rollback_log),
            }));
        }
        return Err(anyhow!(PreflightFailed {
            tool: preflight.tool,
            detail,
            rollback_log: None,
        }));
    }

    // armed before the reload: if the apply wedges the host, the timer
    // still fires
    let handle = engine.arm(ctx, req.rollback_backup, req.timeout, req.work_dir)?;

    match deps.ifupdown.reload(ctx) {
        Ok(method) => log::info!("network configuration applied via {}", method.as_str()),
        Err(e) => log::warn!("network reload did not succeed: {e:#}"),
    }

    let _ = write_snapshot(
        ctx,
        deps.runner,
        deps.fs,
        deps.ifupdown,
        SnapshotLabel::After,
        req.work_dir,
        deps.system_root,
    );

    let mut health_opts = req.health_options.clone();
    health_opts.system_root = deps.system_root.to_path_buf();
    let health = run_health_checks(ctx, deps.runner, deps.fs, &health_opts);
    let health_path = req
        .work_dir
        .join(format!("health_{}.txt", deps.clock.epoch()));
    let _ = deps
        .fs
        .write(&health_path, health.render().as_bytes(), 0o600);

    let not_committed = |timer_race: bool| -> anyhow::Error {
        let restored_ip = run_text(deps.runner, ctx, &CmdSpec::new("ip").args(["-br", "addr"]))
            .ok()
            .and_then(|out| primary_ip(&out));
        anyhow!(NotCommitted {
            rollback_log: handle.log_path.clone(),
            marker: handle.marker_path.clone(),
            restored_ip,
            original_ip: primary_ip_from_snapshot(&before_text),
            rollback_deadline: handle.deadline_epoch(),
            timer_race,
        })
    };

    let remaining = handle.remaining(deps.clock.epoch());
    if ctx.cancelled() {
        return Err(not_committed(false));
    }
    let decision = ui.prompt_network_commit(
        ctx,
        &CommitRequest {
            remaining,
            health: &health,
            nic_repair: &nic_repair,
            diagnostics_dir: req.work_dir,
        },
    );

    match decision {
        CommitDecision::Committed => {
            let disarm = engine.disarm(ctx, &handle)?;
            if disarm.raced {
                return Err(not_committed(true));
            }
            log::info!("network change committed");
            Ok(())
        }
        CommitDecision::Declined | CommitDecision::TimedOut => {
            log::warn!(
                "network change not committed, rollback fires at {}",
                handle.deadline_epoch()
            );
            Err(not_committed(false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::restore::network::rollback::RollbackHandle;
    use crate::tooling::ifupdown::IfupdownCli;
    use crate::tooling::systemd::SystemdCli;
    use crate::ui::testing::ScriptedUi;
    use crate::utils::clock::testing::FixedClock;
    use crate::utils::fs::RealFs;
    use crate::utils::process::testing::ScriptedRunner;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        runner: Arc<ScriptedRunner>,
        fs: RealFs,
        clock: FixedClock,
        ui: ScriptedUi,
    }

    impl Fixture {
        fn new() -> Self {
            let fx = Self {
                tmp: TempDir::new().unwrap(),
                runner: Arc::new(ScriptedRunner::new()),
                fs: RealFs::new(),
                clock: FixedClock::at_epoch(1_700_000_000),
                ui: ScriptedUi::new(),
            };
            fx.fs
                .mkdir_all(&fx.root().join("etc/network"), 0o755)
                .unwrap();
            fx
        }

        fn root(&self) -> PathBuf {
            self.tmp.path().join("root")
        }

        fn work(&self) -> PathBuf {
            self.tmp.path().join("network_apply_1700000000_0")
        }

        fn stage_with_interfaces(&self) -> PathBuf {
            let stage = self.tmp.path().join("stage");
            let f = stage.join("etc/network/interfaces");
            self.fs.mkdir_all(f.parent().unwrap(), 0o755).unwrap();
            self.fs.write(&f, b"auto vmbr0\n", 0o644).unwrap();
            stage
        }

        fn run(&self, stage_root: Option<&Path>) -> Result<()> {
            let systemd = SystemdCli::new(self.runner.clone());
            let ifupdown = IfupdownCli::new(self.runner.clone());
            let root = self.root();
            let deps = NetworkApplyDeps {
                runner: self.runner.as_ref(),
                fs: &self.fs,
                clock: &self.clock,
                systemd: &systemd,
                ifupdown: &ifupdown,
                system_root: &root,
            };
            let req = NetworkApplyRequest {
                rollback_backup: &self.tmp.path().join("full.tar.gz"),
                network_rollback: &self.tmp.path().join("net.tar.gz"),
                stage_root,
                archive_path: &self.tmp.path().join("archive.tar.gz"),
                timeout: Duration::from_secs(180),
                system_type: SystemType::Unknown,
                work_dir: &self.work(),
                health_options: HealthOptions::for_system(SystemType::Unknown),
            };
            apply_network_with_rollback(&Ctx::background(), &self.ui, &deps, &req)
        }

        fn armed_handle_paths(&self) -> RollbackHandle {
            RollbackHandle {
                work_dir: self.work(),
                marker_path: self.work().join("network_rollback_1700000000.marker"),
                script_path: self.work().join("network_rollback_1700000000.sh"),
                log_path: self.work().join("network_rollback_1700000000.log"),
                unit_name: Some("proxsave-rollback-1700000000".into()),
                armed_at: 1_700_000_000,
                timeout: Duration::from_secs(180),
            }
        }
    }

    #[test]
    fn preflight_failure_with_staged_files_rolls_back_immediately() {
        let fx = Fixture::new();
        let stage = fx.stage_with_interfaces();
        fx.runner.fail("ifup -n -a", b"error: invalid config", 1);

        let err = fx.run(Some(&stage)).unwrap_err();
        let pf = err.downcast_ref::<PreflightFailed>().expect("PreflightFailed");
        assert_eq!(pf.tool, "ifup");
        let log = pf.rollback_log.as_ref().expect("rollback log");
        assert!(
            log.ends_with("network_rollback_now_1700000000.log"),
            "{}",
            log.display()
        );

        // staged file was written before the validator rejected it
        assert!(fx.root().join("etc/network/interfaces").exists());
        // the immediate rollback script ran via sh
        let sh_calls: Vec<String> = fx
            .runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("sh ") && c.contains("network_rollback_now_"))
            .collect();
        assert_eq!(sh_calls.len(), 1);
        // no timer was armed
        assert!(fx.runner.calls_matching("systemd-run").is_empty());
    }

    #[test]
    fn preflight_failure_without_staged_write_mutates_nothing() {
        let fx = Fixture::new();
        fx.runner.fail("ifup -n -a", b"error: invalid config", 1);

        let err = fx.run(None).unwrap_err();
        let pf = err.downcast_ref::<PreflightFailed>().expect("PreflightFailed");
        assert!(pf.rollback_log.is_none());
        assert!(fx.runner.calls_matching("systemd-run").is_empty());
        assert!(!fx.work().join("network_rollback_now_1700000000.sh").exists());
    }

    #[test]
    fn commit_timeout_keeps_rollback_armed() {
        let fx = Fixture::new();
        fx.ui.decide_commit(CommitDecision::TimedOut);

        let err = fx.run(None).unwrap_err();
        let nc = err.downcast_ref::<NotCommitted>().expect("NotCommitted");
        assert!(!nc.timer_race);
        assert_eq!(nc.rollback_deadline, 1_700_000_180);

        let handle = fx.armed_handle_paths();
        assert_eq!(nc.rollback_log, handle.log_path);
        assert_eq!(nc.marker, handle.marker_path);
        // marker still present, unit untouched: rollback will fire
        assert!(handle.marker_path.exists());
        assert!(fx.runner.calls_matching("systemctl stop").is_empty());
        assert_eq!(fx.ui.commit_prompts.lock().unwrap().as_slice(), &[180]);
    }

    #[test]
    fn commit_disarms_and_succeeds() {
        let fx = Fixture::new();
        fx.ui.decide_commit(CommitDecision::Committed);
        fx.runner.fail("systemctl is-active proxsave-rollback", b"inactive\n", 3);

        fx.run(None).unwrap();

        let handle = fx.armed_handle_paths();
        assert!(!handle.marker_path.exists());
        assert_eq!(
            fx.runner
                .calls_matching("systemctl stop proxsave-rollback-1700000000.timer")
                .len(),
            1
        );
    }

    #[test]
    fn commit_after_timer_fired_reports_race() {
        let fx = Fixture::new();
        fx.ui.decide_commit(CommitDecision::Committed);
        fx.runner.ok("systemctl is-active proxsave-rollback", b"active\n");

        let err = fx.run(None).unwrap_err();
        let nc = err.downcast_ref::<NotCommitted>().expect("NotCommitted");
        assert!(nc.timer_race);
    }

    #[test]
    fn reload_failure_still_reaches_the_commit_prompt() {
        let fx = Fixture::new();
        fx.ui.decide_commit(CommitDecision::Declined);
        for cmd in ["ifreload -a", "systemctl restart networking", "ifup -a"] {
            fx.runner.fail(cmd, b"boom", 1);
        }

        let err = fx.run(None).unwrap_err();
        assert!(err.downcast_ref::<NotCommitted>().is_some());
        assert_eq!(fx.ui.commit_prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancelled_ctx_returns_not_committed_and_keeps_timer() {
        let fx = Fixture::new();
        let systemd = SystemdCli::new(fx.runner.clone());
        let ifupdown = IfupdownCli::new(fx.runner.clone());
        let root = fx.root();
        let deps = NetworkApplyDeps {
            runner: fx.runner.as_ref(),
            fs: &fx.fs,
            clock: &fx.clock,
            systemd: &systemd,
            ifupdown: &ifupdown,
            system_root: &root,
        };
        let req = NetworkApplyRequest {
            rollback_backup: &fx.tmp.path().join("full.tar.gz"),
            network_rollback: &fx.tmp.path().join("net.tar.gz"),
            stage_root: None,
            archive_path: &fx.tmp.path().join("archive.tar.gz"),
            timeout: Duration::from_secs(180),
            system_type: SystemType::Unknown,
            work_dir: &fx.work(),
            health_options: HealthOptions::for_system(SystemType::Unknown),
        };

        let (ctx, cancel) = Ctx::cancelable(&Ctx::background());
        cancel.cancel();
        let err = apply_network_with_rollback(&ctx, &fx.ui, &deps, &req).unwrap_err();

        // the prompt is never shown; the timer (fallback sleep, since the
        // cancelled ctx refused systemd-run) stays armed
        let nc = err.downcast_ref::<NotCommitted>().expect("NotCommitted");
        assert!(!nc.timer_race);
        assert!(fx.ui.commit_prompts.lock().unwrap().is_empty());
        assert!(fx.armed_handle_paths().marker_path.exists());
        assert_eq!(fx.runner.spawned().len(), 1);
    }
}
