use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing as log;

use crate::commands::restore::categories::SystemType;
use crate::utils::cancel::Ctx;
use crate::utils::fs::Fs;
use crate::utils::process::{CmdSpec, Runner, run_text};
use crate::utils::time::current_epoch;

pub const DNS_TEST_HOST_ENV: &str = "PROXSAVE_DNS_TEST_HOST";
const DNS_TEST_HOST_DEFAULT: &str = "proxmox.com";

const PVE_UI_PORT: u16 = 8006;
const PBS_UI_PORT: u16 = 8007;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Ok,
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub name: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
    pub generated_at: u64,
}

impl HealthReport {
    pub fn severity(&self) -> Severity {
        self.checks
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or(Severity::Ok)
    }

    pub fn render(&self) -> String {
        let mut out = format!("Network health: {}\n", self.severity().as_str());
        for c in &self.checks {
            out.push_str(&format!("  [{:<8}] {}: {}\n", c.severity.as_str(), c.name, c.message));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub system_type: SystemType,
    pub command_timeout: Duration,
    pub enable_gateway_ping: bool,
    pub enable_dns_resolve: bool,
    pub dns_resolve_host: String,
    pub local_port_checks: Vec<u16>,
    /// Management peer, from `SSH_CONNECTION`/`SSH_CLIENT`.
    pub ssh_client: Option<String>,
    /// `/` in production; tests point it into a tempdir.
    pub system_root: PathBuf,
}

impl HealthOptions {
    pub fn for_system(system_type: SystemType) -> Self {
        let port = match system_type {
            SystemType::Pbs => PBS_UI_PORT,
            _ => PVE_UI_PORT,
        };
        Self {
            system_type,
            command_timeout: Duration::from_secs(3),
            enable_gateway_ping: true,
            enable_dns_resolve: true,
            dns_resolve_host: std::env::var(DNS_TEST_HOST_ENV)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DNS_TEST_HOST_DEFAULT.to_string()),
            local_port_checks: vec![port],
            ssh_client: ssh_client_from_env(),
            system_root: PathBuf::from("/"),
        }
    }
}

fn ssh_client_from_env() -> Option<String> {
    for var in ["SSH_CONNECTION", "SSH_CLIENT"] {
        if let Ok(v) = std::env::var(var)
            && let Some(first) = v.split_whitespace().next()
            && !first.is_empty()
        {
            return Some(first.to_string());
        }
    }
    None
}

/// Probe the post-apply network state. Advisory: the report shapes the
/// commit prompt's wording, it never aborts the apply by itself.
pub fn run_health_checks(
    ctx: &Ctx,
    runner: &dyn Runner,
    fs: &dyn Fs,
    options: &HealthOptions,
) -> HealthReport {
    let mut checks = Vec::new();
    let run = |spec: &CmdSpec| -> Result<String, String> {
        let child = Ctx::with_timeout(ctx, options.command_timeout);
        run_text(runner, &child, spec).map_err(|e| format!("{e:#}"))
    };

    // losing the management route cuts the operator off mid-commit
    if let Some(client) = &options.ssh_client {
        let spec = CmdSpec::new("ip").args(["route", "get", client.as_str()]);
        match run(&spec) {
            Ok(out) => push(&mut checks, "SSH route", Severity::Ok, first_line(&out)),
            Err(e) => push(&mut checks, "SSH route", Severity::Critical, e),
        }
    }

    let mut gateway = None;
    let mut iface = None;
    let spec = CmdSpec::new("ip").args(["route", "show", "default"]);
    match run(&spec) {
        Ok(out) if !out.trim().is_empty() => {
            (gateway, iface) = default_route_parts(&out);
            push(&mut checks, "Default route", Severity::Ok, first_line(&out));
        }
        Ok(_) => push(
            &mut checks,
            "Default route",
            Severity::Warn,
            "no default route".into(),
        ),
        Err(e) => push(&mut checks, "Default route", Severity::Warn, e),
    }

    if let Some(dev) = &iface {
        let spec = CmdSpec::new("ip").args(["-o", "link", "show", "dev", dev.as_str()]);
        match run(&spec) {
            Ok(out) => push(&mut checks, "Link", Severity::Ok, first_line(&out)),
            Err(e) => push(&mut checks, "Link", Severity::Warn, e),
        }
        let spec = CmdSpec::new("ip").args([
            "-o",
            "addr",
            "show",
            "dev",
            dev.as_str(),
            "scope",
            "global",
        ]);
        match run(&spec) {
            Ok(out) if !out.trim().is_empty() => {
                push(&mut checks, "Addresses", Severity::Ok, first_line(&out))
            }
            Ok(_) => push(
                &mut checks,
                "Addresses",
                Severity::Warn,
                format!("no global address on {dev}"),
            ),
            Err(e) => push(&mut checks, "Addresses", Severity::Warn, e),
        }
    } else {
        push(
            &mut checks,
            "Link",
            Severity::Warn,
            "no default interface detected".into(),
        );
    }

    if options.enable_gateway_ping {
        match &gateway {
            Some(gw) => {
                let spec = CmdSpec::new("ping").args(["-c", "1", "-W", "1", gw.as_str()]);
                match run(&spec) {
                    Ok(_) => push(&mut checks, "Gateway", Severity::Ok, format!("{gw} answers")),
                    Err(e) => push(&mut checks, "Gateway", Severity::Warn, e),
                }
            }
            None => push(
                &mut checks,
                "Gateway",
                Severity::Warn,
                "no gateway in default route".into(),
            ),
        }
    }

    dns_checks(&mut checks, fs, options, &run);

    for port in &options.local_port_checks {
        let addr = format!("127.0.0.1:{port}");
        match addr
            .parse()
            .ok()
            .and_then(|a| TcpStream::connect_timeout(&a, options.command_timeout).ok())
        {
            Some(_) => push(&mut checks, &format!("Port {port}"), Severity::Ok, "accepting".into()),
            None => push(
                &mut checks,
                &format!("Port {port}"),
                Severity::Warn,
                format!("{addr} refused"),
            ),
        }
    }

    if options.system_type == SystemType::Pve {
        cluster_checks(&mut checks, fs, options, &run);
    }

    let report = HealthReport {
        checks,
        generated_at: current_epoch(),
    };
    log::info!("health probe finished: {}", report.severity().as_str());
    report
}

fn dns_checks(
    checks: &mut Vec<HealthCheck>,
    fs: &dyn Fs,
    options: &HealthOptions,
    run: &dyn Fn(&CmdSpec) -> Result<String, String>,
) {
    let resolv = options.system_root.join("etc/resolv.conf");
    match fs.read(&resolv) {
        Ok(data) => {
            let text = String::from_utf8_lossy(&data);
            let servers: Vec<&str> = text
                .lines()
                .filter(|l| l.trim_start().starts_with("nameserver"))
                .collect();
            if servers.is_empty() {
                push(checks, "DNS config", Severity::Warn, "no nameserver entries".into());
            } else {
                push(
                    checks,
                    "DNS config",
                    Severity::Ok,
                    format!("{} nameserver(s)", servers.len()),
                );
            }
        }
        Err(_) => push(checks, "DNS config", Severity::Warn, "resolv.conf missing".into()),
    }

    if options.enable_dns_resolve {
        let host = &options.dns_resolve_host;
        let spec = CmdSpec::new("getent").args(["hosts", host.as_str()]);
        match run(&spec) {
            Ok(out) if !out.trim().is_empty() => push(
                checks,
                "DNS resolve",
                Severity::Ok,
                format!("{host} -> {}", first_line(&out)),
            ),
            Ok(_) | Err(_) => push(
                checks,
                "DNS resolve",
                Severity::Warn,
                format!("cannot resolve {host}"),
            ),
        }
    }
}

fn cluster_checks(
    checks: &mut Vec<HealthCheck>,
    fs: &dyn Fs,
    options: &HealthOptions,
    run: &dyn Fn(&CmdSpec) -> Result<String, String>,
) {
    let spec = CmdSpec::new("mountpoint").arg(
        options
            .system_root
            .join("etc/pve")
            .display()
            .to_string(),
    );
    match run(&spec) {
        Ok(_) => push(checks, "pmxcfs", Severity::Ok, "/etc/pve is mounted".into()),
        Err(_) => push(checks, "pmxcfs", Severity::Warn, "/etc/pve not mounted".into()),
    }

    let corosync = options.system_root.join("etc/pve/corosync.conf");
    if fs.exists(&corosync) {
        push(checks, "Corosync config", Severity::Ok, "present".into());

        for unit in ["pve-cluster", "corosync"] {
            let spec = CmdSpec::new("systemctl").args(["is-active", unit]);
            match run(&spec) {
                Ok(out) if out.trim() == "active" => {
                    push(checks, &format!("Unit {unit}"), Severity::Ok, "active".into())
                }
                Ok(out) => push(
                    checks,
                    &format!("Unit {unit}"),
                    Severity::Warn,
                    out.trim().to_string(),
                ),
                Err(e) => push(checks, &format!("Unit {unit}"), Severity::Warn, e),
            }
        }

        let spec = CmdSpec::new("pvecm").arg("status");
        match run(&spec) {
            Ok(out) => {
                let fields = quorum_fields(&out);
                let quorate = fields
                    .iter()
                    .find(|(k, _)| k == "Quorate")
                    .map(|(_, v)| v.as_str());
                let sev = match quorate {
                    Some(v) if v.starts_with("Yes") => Severity::Ok,
                    _ => Severity::Warn,
                };
                let msg = if fields.is_empty() {
                    "pvecm status gave no quorum fields".to_string()
                } else {
                    fields
                        .iter()
                        .map(|(k, v)| format!("{k}: {v}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                push(checks, "Quorum", sev, msg);
            }
            Err(e) => push(checks, "Quorum", Severity::Warn, e),
        }
    } else {
        push(
            checks,
            "Corosync config",
            Severity::Ok,
            "absent (standalone node)".into(),
        );
    }
}

/// Pull `Quorate`, `Nodes`, `Expected votes`, `Total votes` and
/// `Ring*_addr` lines out of `pvecm status` output.
pub fn quorum_fields(out: &str) -> Vec<(String, String)> {
    static RING_ADDR: OnceLock<Regex> = OnceLock::new();
    let ring = RING_ADDR.get_or_init(|| Regex::new(r"^Ring\d+_addr$").expect("valid pattern"));

    let mut fields = Vec::new();
    for line in out.lines() {
        let Some((k, v)) = line.split_once(':') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim();
        let wanted = matches!(k, "Quorate" | "Nodes" | "Expected votes" | "Total votes")
            || ring.is_match(k);
        if wanted {
            fields.push((k.to_string(), v.to_string()));
        }
    }
    fields
}

/// `default via <gw> dev <iface> ...`
fn default_route_parts(out: &str) -> (Option<String>, Option<String>) {
    let mut gw = None;
    let mut dev = None;
    let words: Vec<&str> = out.split_whitespace().collect();
    for pair in words.windows(2) {
        match pair[0] {
            "via" => gw = Some(pair[1].to_string()),
            "dev" => dev = Some(pair[1].to_string()),
            _ => {}
        }
    }
    (gw, dev)
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or("").trim().to_string()
}

fn push(checks: &mut Vec<HealthCheck>, name: &str, severity: Severity, message: String) {
    checks.push(HealthCheck {
        name: name.to_string(),
        severity,
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fs::RealFs;
    use crate::utils::process::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn options(tmp: &TempDir, system_type: SystemType) -> HealthOptions {
        HealthOptions {
            system_type,
            command_timeout: Duration::from_secs(3),
            enable_gateway_ping: false,
            enable_dns_resolve: false,
            dns_resolve_host: "proxmox.com".into(),
            local_port_checks: Vec::new(),
            ssh_client: None,
            system_root: tmp.path().to_path_buf(),
        }
    }

    #[test]
    fn ssh_route_failure_is_critical() {
        let tmp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        runner.fail("ip route get 10.0.0.9", b"RTNETLINK answers: Network is unreachable", 2);
        runner.ok("ip route show default", b"default via 10.0.0.1 dev vmbr0\n");

        let mut opts = options(&tmp, SystemType::Unknown);
        opts.ssh_client = Some("10.0.0.9".into());
        let report = run_health_checks(&Ctx::background(), &runner, &RealFs::new(), &opts);

        assert_eq!(report.severity(), Severity::Critical);
        let ssh = &report.checks[0];
        assert_eq!(ssh.name, "SSH route");
        assert_eq!(ssh.severity, Severity::Critical);
    }

    #[test]
    fn healthy_route_and_port() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::new();
        fs.mkdir_all(&tmp.path().join("etc"), 0o755).unwrap();
        fs.write(
            &tmp.path().join("etc/resolv.conf"),
            b"nameserver 1.1.1.1\n",
            0o644,
        )
        .unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let runner = ScriptedRunner::new();
        runner.ok("ip route show default", b"default via 10.0.0.1 dev vmbr0 proto kernel\n");
        runner.ok("ip -o link show dev vmbr0", b"2: vmbr0: <BROADCAST,UP> ...\n");
        runner.ok(
            "ip -o addr show dev vmbr0 scope global",
            b"2: vmbr0 inet 10.0.0.5/24 ...\n",
        );

        let mut opts = options(&tmp, SystemType::Unknown);
        opts.local_port_checks = vec![port];
        let report = run_health_checks(&Ctx::background(), &runner, &fs, &opts);

        assert_eq!(report.severity(), Severity::Ok, "{}", report.render());
        assert!(report.render().contains(&format!("Port {port}")));
    }

    #[test]
    fn pve_quorum_fields_are_parsed() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::new();
        fs.mkdir_all(&tmp.path().join("etc/pve"), 0o755).unwrap();
        fs.write(&tmp.path().join("etc/pve/corosync.conf"), b"totem{}", 0o640)
            .unwrap();

        let runner = ScriptedRunner::new();
        runner.ok("ip route show default", b"default via 10.0.0.1 dev vmbr0\n");
        runner.ok("ip -o link show dev vmbr0", b"ok\n");
        runner.ok("ip -o addr show dev vmbr0 scope global", b"inet 10.0.0.5/24\n");
        runner.ok("mountpoint", b"/etc/pve is a mountpoint\n");
        runner.ok("systemctl is-active pve-cluster", b"active\n");
        runner.ok("systemctl is-active corosync", b"active\n");
        runner.ok(
            "pvecm status",
            b"Cluster information\nNodes:             3\nExpected votes:   3\nTotal votes:      3\nQuorate:          Yes\nRing0_addr: 10.0.0.5\n",
        );

        let opts = options(&tmp, SystemType::Pve);
        let report = run_health_checks(&Ctx::background(), &runner, &fs, &opts);

        assert_eq!(report.severity(), Severity::Warn); // resolv.conf missing
        let quorum = report.checks.iter().find(|c| c.name == "Quorum").unwrap();
        assert_eq!(quorum.severity, Severity::Ok);
        assert!(quorum.message.contains("Quorate: Yes"));
        assert!(quorum.message.contains("Nodes: 3"));
        assert!(quorum.message.contains("Ring0_addr: 10.0.0.5"));
    }

    #[test]
    fn lost_quorum_is_a_warning() {
        let out = "Quorate: No\nExpected votes: 3\nTotal votes: 1\n";
        let fields = quorum_fields(out);
        assert_eq!(fields[0], ("Quorate".to_string(), "No".to_string()));
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn default_route_parsing() {
        let (gw, dev) =
            default_route_parts("default via 192.168.1.1 dev eth0 proto static metric 100\n");
        assert_eq!(gw.as_deref(), Some("192.168.1.1"));
        assert_eq!(dev.as_deref(), Some("eth0"));

        let (gw, dev) = default_route_parts("");
        assert!(gw.is_none() && dev.is_none());
    }
}
