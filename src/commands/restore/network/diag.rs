use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::tooling::ifupdown::IfupdownPort;
use crate::utils::cancel::Ctx;
use crate::utils::fs::Fs;
use crate::utils::process::{CmdSpec, Runner, run_text};
use crate::utils::time::{current_epoch, fmt_utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotLabel {
    Before,
    After,
    AfterRollback,
}

impl SnapshotLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::AfterRollback => "after_rollback",
        }
    }
}

const DISK_FILES: &[&str] = &["etc/hosts", "etc/hostname", "etc/resolv.conf"];
const STACK_UNITS: &[&str] = &["networking", "systemd-networkd", "NetworkManager"];

/// Capture live and on-disk network state into `<diag_dir>/<label>.txt`
/// (mode 0600). Tool failures are recorded inline, never fatal.
pub fn write_snapshot(
    ctx: &Ctx,
    runner: &dyn Runner,
    fs: &dyn Fs,
    ifupdown: &dyn IfupdownPort,
    label: SnapshotLabel,
    diag_dir: &Path,
    system_root: &Path,
) -> Result<PathBuf> {
    let mut out = String::new();
    let stamp = fmt_utc(current_epoch()).unwrap_or_default();
    out.push_str(&format!("== network snapshot: {} ({stamp}) ==\n", label.as_str()));

    for (title, spec) in [
        ("ip -br link", CmdSpec::new("ip").args(["-br", "link"])),
        ("ip -br addr", CmdSpec::new("ip").args(["-br", "addr"])),
        ("ip route", CmdSpec::new("ip").arg("route")),
    ] {
        section(&mut out, title, &capture(ctx, runner, &spec));
    }

    let net_dir = system_root.join("etc/network");
    if let Ok(entries) = fs.read_dir(&net_dir) {
        for entry in entries {
            let Ok(meta) = fs.symlink_metadata(&entry) else {
                continue;
            };
            if meta.is_dir() {
                continue;
            }
            let title = entry.display().to_string();
            match fs.read(&entry) {
                Ok(data) => section(&mut out, &title, &String::from_utf8_lossy(&data)),
                Err(e) => section(&mut out, &title, &format!("<unreadable: {e:#}>")),
            }
        }
    } else {
        section(&mut out, &net_dir.display().to_string(), "<missing>");
    }

    for rel in DISK_FILES {
        let path = system_root.join(rel);
        match fs.read(&path) {
            Ok(data) => section(&mut out, rel, &String::from_utf8_lossy(&data)),
            Err(_) => section(&mut out, rel, "<missing>"),
        }
    }

    for unit in STACK_UNITS {
        let spec = CmdSpec::new("systemctl").args(["is-active", unit]);
        section(
            &mut out,
            &format!("systemctl is-active {unit}"),
            &capture(ctx, runner, &spec),
        );
    }

    section(&mut out, "ifquery --running -a", &ifupdown.running_state(ctx));

    fs.mkdir_all(diag_dir, 0o700)?;
    let path = diag_dir.join(format!("{}.txt", label.as_str()));
    fs.write(&path, out.as_bytes(), 0o600)
        .with_context(|| format!("write snapshot {}", path.display()))?;
    Ok(path)
}

fn capture(ctx: &Ctx, runner: &dyn Runner, spec: &CmdSpec) -> String {
    match run_text(runner, ctx, spec) {
        Ok(out) => out,
        Err(e) => format!("<failed: {e:#}>"),
    }
}

fn section(out: &mut String, title: &str, body: &str) {
    out.push_str(&format!("\n-- {title} --\n"));
    out.push_str(body.trim_end());
    out.push('\n');
}

/// First global unicast address from `ip -br addr` style output,
/// loopback excluded, mask stripped.
pub fn primary_ip(br_addr: &str) -> Option<String> {
    for line in br_addr.lines() {
        let mut words = line.split_whitespace();
        let dev = words.next()?;
        if dev.starts_with("lo") {
            continue;
        }
        for w in words {
            if let Some((addr, _mask)) = w.split_once('/')
                && addr.contains('.')
                && !addr.starts_with("127.")
            {
                return Some(addr.to_string());
            }
        }
    }
    None
}

/// Recover the pre-apply address from a `before.txt` snapshot.
pub fn primary_ip_from_snapshot(snapshot: &str) -> Option<String> {
    let mut in_addr = false;
    let mut body = String::new();
    for line in snapshot.lines() {
        if line.starts_with("-- ") {
            in_addr = line == "-- ip -br addr --";
            continue;
        }
        if in_addr {
            body.push_str(line);
            body.push('\n');
        }
    }
    primary_ip(&body)
}
