use std::sync::Arc;

use anyhow::Result;
use tracing as log;

use crate::errors::CmdFailed;
use crate::utils::cancel::Ctx;
use crate::utils::process::{CmdSpec, Runner};
use crate::utils::time::current_epoch;

/// Validators tried in strict order; the first whose flags the installed
/// tool understands decides the preflight outcome.
const PREFLIGHT_CANDIDATES: &[(&str, &[&str], &str)] = &[
    ("ifup", &["-n", "-a"], "-n"),
    ("ifup", &["--no-act", "-a"], "--no-act"),
    ("ifreload", &["--syntax-check", "-a"], "--syntax-check"),
];

const FLAG_REJECTED: &[&str] = &[
    "unrecognized option",
    "unknown option",
    "illegal option",
    "invalid option",
    "bad option",
];

#[derive(Debug, Clone)]
pub struct PreflightResult {
    pub tool: String,
    pub args: Vec<String>,
    pub output: String,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub exit_error: Option<String>,
    pub checked_at: u64,
    pub command_hint: String,
}

impl PreflightResult {
    pub fn ok(&self) -> bool {
        !self.skipped && self.exit_error.is_none()
    }

    /// Plain-text form for the diagnostics directory.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("checked_at: {}\n", self.checked_at));
        if self.skipped {
            out.push_str(&format!(
                "skipped: {}\n",
                self.skip_reason.as_deref().unwrap_or("unknown")
            ));
            return out;
        }
        out.push_str(&format!("tool: {}\n", self.tool));
        out.push_str(&format!("args: {}\n", self.args.join(" ")));
        out.push_str(&format!("command: {}\n", self.command_hint));
        match &self.exit_error {
            None => out.push_str("result: ok\n"),
            Some(e) => out.push_str(&format!("result: {e}\n")),
        }
        if !self.output.is_empty() {
            out.push_str("output:\n");
            out.push_str(&self.output);
            if !self.output.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMethod {
    Ifreload,
    SystemctlRestart,
    Ifup,
}

impl ReloadMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ifreload => "ifreload -a",
            Self::SystemctlRestart => "systemctl restart networking",
            Self::Ifup => "ifup -a",
        }
    }
}

pub trait IfupdownPort: Send + Sync {
    /// Validate `/etc/network` without touching live state.
    fn preflight(&self, ctx: &Ctx) -> PreflightResult;

    /// Apply the on-disk configuration; first successful method wins.
    fn reload(&self, ctx: &Ctx) -> Result<ReloadMethod>;

    /// `ifquery --running -a` output for diagnostics; empty when absent.
    fn running_state(&self, ctx: &Ctx) -> String;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct IfupdownCli {
    runner: Arc<DynRunner>,
}

impl IfupdownCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl IfupdownPort for IfupdownCli {
    fn preflight(&self, ctx: &Ctx) -> PreflightResult {
        for (tool, args, flag) in PREFLIGHT_CANDIDATES {
            let spec = CmdSpec::new(*tool).args(args.iter().copied());
            let hint = spec.line();
            match self.runner.run_combined(ctx, &spec) {
                Ok(out) => {
                    return PreflightResult {
                        tool: tool.to_string(),
                        args: args.iter().map(|s| s.to_string()).collect(),
                        output: String::from_utf8_lossy(&out).into_owned(),
                        skipped: false,
                        skip_reason: None,
                        exit_error: None,
                        checked_at: current_epoch(),
                        command_hint: hint,
                    };
                }
                Err(e) if e.downcast_ref::<CmdFailed>().is_some() => {
                    if flag_unsupported(&e, flag) {
                        log::debug!("{hint}: flag {flag} unsupported, trying next validator");
                        continue;
                    }
                    let output = e
                        .downcast_ref::<CmdFailed>()
                        .map(|f| f.output_text())
                        .unwrap_or_default();
                    return PreflightResult {
                        tool: tool.to_string(),
                        args: args.iter().map(|s| s.to_string()).collect(),
                        output,
                        skipped: false,
                        skip_reason: None,
                        exit_error: Some(format!("{e:#}")),
                        checked_at: current_epoch(),
                        command_hint: hint,
                    };
                }
                // tool not installed (spawn failure): try the next candidate
                Err(e) => {
                    log::debug!("{hint}: {e:#}");
                    continue;
                }
            }
        }

        PreflightResult {
            tool: String::new(),
            args: Vec::new(),
            output: String::new(),
            skipped: true,
            skip_reason: Some("no network validator available".to_string()),
            exit_error: None,
            checked_at: current_epoch(),
            command_hint: String::new(),
        }
    }

    fn reload(&self, ctx: &Ctx) -> Result<ReloadMethod> {
        let attempts: [(ReloadMethod, CmdSpec); 3] = [
            (ReloadMethod::Ifreload, CmdSpec::new("ifreload").arg("-a")),
            (
                ReloadMethod::SystemctlRestart,
                CmdSpec::new("systemctl").args(["restart", "networking"]),
            ),
            (ReloadMethod::Ifup, CmdSpec::new("ifup").arg("-a")),
        ];

        let mut last: Option<anyhow::Error> = None;
        for (method, spec) in attempts {
            match self.runner.run_combined(ctx, &spec) {
                Ok(_) => {
                    log::info!("network reloaded via {}", method.as_str());
                    return Ok(method);
                }
                Err(e) => {
                    log::warn!("{} failed: {e:#}", method.as_str());
                    last = Some(e);
                }
            }
        }
        Err(last
            .unwrap_or_else(|| anyhow::anyhow!("no reload method available"))
            .context("all network reload attempts failed"))
    }

    fn running_state(&self, ctx: &Ctx) -> String {
        let spec = CmdSpec::new("ifquery").args(["--running", "-a"]);
        match self.runner.run_combined(ctx, &spec) {
            Ok(out) => String::from_utf8_lossy(&out).into_owned(),
            Err(_) => String::new(),
        }
    }
}

fn flag_unsupported(e: &anyhow::Error, flag: &str) -> bool {
    let Some(failed) = e.downcast_ref::<CmdFailed>() else {
        return false;
    };
    let text = failed.output_text().to_lowercase();
    FLAG_REJECTED.iter().any(|m| text.contains(m)) && text.contains(flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::process::testing::ScriptedRunner;

    #[test]
    fn preflight_walks_candidates_on_unsupported_flags() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("ifup -n -a", b"ifup: unrecognized option '-n'", 2);
        runner.fail("ifup --no-act -a", b"ifup: unknown option '--no-act'", 2);
        let cli = IfupdownCli::new(runner.clone());

        let r = cli.preflight(&Ctx::background());
        assert!(r.ok());
        assert_eq!(r.tool, "ifreload");
        assert_eq!(r.command_hint, "ifreload --syntax-check -a");
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn preflight_real_failure_stops_the_walk() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("ifup -n -a", b"error: invalid config", 1);
        let cli = IfupdownCli::new(runner.clone());

        let r = cli.preflight(&Ctx::background());
        assert!(!r.ok());
        assert!(!r.skipped);
        assert!(r.exit_error.is_some());
        assert!(r.output.contains("invalid config"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn flag_unsupported_needs_both_marker_and_flag() {
        let e = anyhow::anyhow!(CmdFailed {
            rendered: "ifup -n -a".into(),
            status: 1,
            output: b"ifup: unrecognized option '-n'".to_vec(),
        });
        assert!(flag_unsupported(&e, "-n"));

        let other = anyhow::anyhow!(CmdFailed {
            rendered: "ifup -n -a".into(),
            status: 1,
            output: b"error: invalid config".to_vec(),
        });
        assert!(!flag_unsupported(&other, "-n"));
    }

    #[test]
    fn reload_falls_through_to_first_success() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("ifreload -a", b"ifreload: command failed", 1);
        let cli = IfupdownCli::new(runner.clone());

        let method = cli.reload(&Ctx::background()).unwrap();
        assert_eq!(method, ReloadMethod::SystemctlRestart);
        assert_eq!(
            runner.calls(),
            vec!["ifreload -a", "systemctl restart networking"]
        );
    }

    #[test]
    fn reload_reports_total_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("ifreload -a", b"x", 1);
        runner.fail("systemctl restart networking", b"x", 1);
        runner.fail("ifup -a", b"x", 1);
        let cli = IfupdownCli::new(runner);
        let err = cli.reload(&Ctx::background()).unwrap_err().to_string();
        assert!(err.contains("all network reload attempts failed"));
    }

    #[test]
    fn preflight_ok_maps_to_result() {
        let r = PreflightResult {
            tool: "ifup".into(),
            args: vec!["-n".into(), "-a".into()],
            output: String::new(),
            skipped: false,
            skip_reason: None,
            exit_error: None,
            checked_at: 1,
            command_hint: "ifup -n -a".into(),
        };
        assert!(r.ok());
        let skipped = PreflightResult {
            skipped: true,
            skip_reason: Some("no network validator available".into()),
            ..r.clone()
        };
        assert!(!skipped.ok());
    }
}
