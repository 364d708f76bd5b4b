use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing as log;

use crate::tooling::systemd::SystemdPort;
use crate::utils::cancel::Ctx;
use crate::utils::clock::Clock;
use crate::utils::fs::Fs;
use crate::utils::process::{CmdSpec, Runner, quote_path};

/// Auxiliary files the prune step also considers beyond `/etc/network`.
const PRUNE_EXTRA: &[&str] = &[
    "/etc/cloud/cloud.cfg.d/99-disable-network-config.cfg",
    "/etc/dnsmasq.d/lxc-vmbr1.conf",
];

/// An armed deferred rollback. While the marker exists, the scheduled
/// executor will restore the snapshot; removing the marker cancels it.
#[derive(Debug, Clone)]
pub struct RollbackHandle {
    pub work_dir: PathBuf,
    pub marker_path: PathBuf,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
    pub unit_name: Option<String>,
    /// Unix seconds when the timer was armed.
    pub armed_at: u64,
    pub timeout: Duration,
}

impl RollbackHandle {
    pub fn remaining(&self, now_epoch: u64) -> Duration {
        let deadline = self.armed_at + self.timeout.as_secs();
        Duration::from_secs(deadline.saturating_sub(now_epoch))
    }

    pub fn deadline_epoch(&self) -> u64 {
        self.armed_at + self.timeout.as_secs()
    }
}

#[derive(Debug)]
pub struct DisarmOutcome {
    /// The timer fired before disarm; the script is already running.
    pub raced: bool,
}

pub struct RollbackEngine<'a> {
    pub runner: &'a dyn Runner,
    pub fs: &'a dyn Fs,
    pub clock: &'a dyn Clock,
    pub systemd: &'a dyn SystemdPort,
}

impl RollbackEngine<'_> {
    /// Write marker and script, then schedule execution after `timeout`.
    /// Prefers a systemd transient timer; falls back to a detached shell
    /// sleep so the rollback survives the orchestrator dying mid-apply.
    pub fn arm(
        &self,
        ctx: &Ctx,
        backup_tar: &Path,
        timeout: Duration,
        work_dir: &Path,
    ) -> Result<RollbackHandle> {
        let ts = self.clock.epoch();
        let marker_path = work_dir.join(format!("network_rollback_{ts}.marker"));
        let script_path = work_dir.join(format!("network_rollback_{ts}.sh"));
        let log_path = work_dir.join(format!("network_rollback_{ts}.log"));

        self.fs.mkdir_all(work_dir, 0o700)?;
        self.fs
            .write(&marker_path, format!("{ts}\n").as_bytes(), 0o600)
            .context("write rollback marker")?;
        let script = build_script(backup_tar, &marker_path, &log_path, true);
        self.fs
            .write(&script_path, script.as_bytes(), 0o700)
            .context("write rollback script")?;

        let unit = format!("proxsave-rollback-{ts}");
        let secs = timeout.as_secs().max(1);
        let unit_name = match self.systemd.schedule_once(ctx, &unit, secs, &script_path) {
            Ok(()) => {
                log::info!("rollback armed via transient timer {unit} ({secs}s)");
                Some(unit)
            }
            Err(e) => {
                log::warn!("systemd-run unavailable ({e:#}), falling back to detached sleep");
                let spec = CmdSpec::new("sh").arg("-c").arg(format!(
                    "sleep {secs}; sh {}",
                    quote_path(&script_path)
                ));
                self.runner
                    .spawn_detached(&spec)
                    .context("arm detached rollback")?;
                None
            }
        };

        Ok(RollbackHandle {
            work_dir: work_dir.to_path_buf(),
            marker_path,
            script_path,
            log_path,
            unit_name,
            armed_at: ts,
            timeout,
        })
    }

    /// Marker removal strictly precedes stopping the unit so a timer that
    /// fires mid-disarm observes the cancellation. Returns whether the
    /// script was already running (commit arrived too late).
    pub fn disarm(&self, ctx: &Ctx, handle: &RollbackHandle) -> Result<DisarmOutcome> {
        if self.fs.exists(&handle.marker_path) {
            self.fs
                .remove_file(&handle.marker_path)
                .context("remove rollback marker")?;
        }

        let mut raced = false;
        if let Some(unit) = &handle.unit_name {
            let state = self.systemd.unit_state(ctx, &format!("{unit}.service"));
            raced = state == "active" || state == "activating";
            self.systemd.cancel_timer(ctx, unit);
        }
        if raced {
            log::warn!("rollback script already running, disarm raced the timer");
        } else {
            log::info!("rollback disarmed ({})", handle.work_dir.display());
        }
        Ok(DisarmOutcome { raced })
    }

    /// Synchronous rollback: same script, marker written inline, no
    /// network reload (the caller never reloaded yet).
    pub fn rollback_now(&self, ctx: &Ctx, backup_tar: &Path, work_dir: &Path) -> Result<PathBuf> {
        let ts = self.clock.epoch();
        let marker_path = work_dir.join(format!("network_rollback_now_{ts}.marker"));
        let script_path = work_dir.join(format!("network_rollback_now_{ts}.sh"));
        let log_path = work_dir.join(format!("network_rollback_now_{ts}.log"));

        self.fs.mkdir_all(work_dir, 0o700)?;
        self.fs
            .write(&marker_path, format!("{ts}\n").as_bytes(), 0o600)?;
        let script = build_script(backup_tar, &marker_path, &log_path, false);
        self.fs.write(&script_path, script.as_bytes(), 0o700)?;

        let spec = CmdSpec::new("sh").arg(script_path.display().to_string());
        self.runner
            .run_combined(ctx, &spec)
            .context("run immediate network rollback")?;
        Ok(log_path)
    }
}

/// The shell contract: header, marker gate, snapshot extraction, prune of
/// files absent from the snapshot manifest, optional reload chain, marker
/// removal and footer. All embedded paths are single-quoted.
fn build_script(backup_tar: &Path, marker: &Path, log_file: &Path, reload: bool) -> String {
    let backup = quote_path(backup_tar);
    let marker = quote_path(marker);
    let log = quote_path(log_file);

    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    s.push_str("set -u\n");
    s.push_str(&format!("BACKUP={backup}\n"));
    s.push_str(&format!("MARKER={marker}\n"));
    s.push_str(&format!("LOG={log}\n"));
    s.push_str("log() { echo \"$1\" >> \"$LOG\"; }\n");
    s.push_str("\n");
    s.push_str("log \"== network rollback started $(date -u '+%Y-%m-%dT%H:%M:%SZ') ==\"\n");
    s.push_str("if [ ! -e \"$MARKER\" ]; then\n");
    s.push_str("    log \"marker missing, rollback cancelled\"\n");
    s.push_str("    exit 0\n");
    s.push_str("fi\n");
    s.push_str("\n");
    s.push_str("log \"extracting snapshot over /\"\n");
    s.push_str("tar -xzf \"$BACKUP\" -C / >> \"$LOG\" 2>&1\n");
    s.push_str("\n");
    s.push_str("manifest=$(tar -tzf \"$BACKUP\" | sed -e 's|^\\./||' -e 's|/$||')\n");
    s.push_str("prune() {\n");
    s.push_str("    rel=\"${1#/}\"\n");
    s.push_str("    if ! printf '%s\\n' \"$manifest\" | grep -Fqx \"$rel\"; then\n");
    s.push_str("        log \"pruning $1\"\n");
    s.push_str("        rm -f \"$1\"\n");
    s.push_str("    fi\n");
    s.push_str("}\n");
    s.push_str(
        "find /etc/network -mindepth 1 \\( -type f -o -type l \\) 2>/dev/null | \
         while read -r f; do\n",
    );
    s.push_str("    prune \"$f\"\n");
    s.push_str("done\n");
    for extra in PRUNE_EXTRA {
        s.push_str(&format!("[ -e '{extra}' ] && prune '{extra}'\n"));
    }
    s.push_str("\n");
    if reload {
        s.push_str("if ifreload -a >> \"$LOG\" 2>&1; then\n");
        s.push_str("    log \"reloaded via ifreload -a\"\n");
        s.push_str("elif systemctl restart networking >> \"$LOG\" 2>&1; then\n");
        s.push_str("    log \"reloaded via systemctl restart networking\"\n");
        s.push_str("elif ifup -a >> \"$LOG\" 2>&1; then\n");
        s.push_str("    log \"reloaded via ifup -a\"\n");
        s.push_str("else\n");
        s.push_str("    log \"all reload attempts failed\"\n");
        s.push_str("fi\n");
        s.push_str("\n");
    }
    s.push_str("rm -f \"$MARKER\"\n");
    s.push_str("log \"== network rollback finished ==\"\n");
    s
}
