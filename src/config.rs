use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use config as cfg;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Config {
    pub restore: RestoreCfg,
    pub network: NetworkCfg,
    pub registry: RegistryCfg,
}

#[derive(Debug, Clone)]
pub struct RestoreCfg {
    /// Base for per-restore working directories.
    pub work_base: PathBuf,
    /// Destination root for live paths; only tests change this.
    pub system_root: PathBuf,
    pub rollback_timeout: Duration,
    pub commit_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NetworkCfg {
    pub probe_timeout: Duration,
    pub gateway_ping: bool,
    pub dns_resolve: bool,
    /// Overrides the PROXSAVE_DNS_TEST_HOST / built-in default chain.
    pub dns_test_host: Option<String>,
    /// Empty means role default (8006 on PVE, 8007 on PBS).
    pub local_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct RegistryCfg {
    /// Registry file; `None` falls back to env, then the state dir.
    pub file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            restore: RestoreCfg {
                work_base: PathBuf::from(crate::utils::tempdir::DEFAULT_BASE),
                system_root: PathBuf::from("/"),
                rollback_timeout: Duration::from_secs(180),
                commit_timeout: Duration::from_secs(90),
            },
            network: NetworkCfg {
                probe_timeout: Duration::from_secs(3),
                gateway_ping: true,
                dns_resolve: true,
                dns_test_host: None,
                local_ports: Vec::new(),
            },
            registry: RegistryCfg { file: None },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    restore: RawRestore,
    #[serde(default)]
    network: RawNetwork,
    #[serde(default)]
    registry: RawRegistry,
}

#[derive(Debug, Default, Deserialize)]
struct RawRestore {
    work_base: Option<String>,
    system_root: Option<String>,
    rollback_timeout_secs: Option<u64>,
    commit_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetwork {
    probe_timeout_secs: Option<u64>,
    gateway_ping: Option<bool>,
    dns_resolve: Option<bool>,
    dns_test_host: Option<String>,
    local_ports: Option<Vec<u16>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRegistry {
    file: Option<String>,
}

impl Config {
    /// Missing config file is fine; every knob has a default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        let defaults = Self::default();

        let work_base = trim_opt(raw.restore.work_base)
            .map(PathBuf::from)
            .unwrap_or(defaults.restore.work_base);
        let system_root = trim_opt(raw.restore.system_root)
            .map(PathBuf::from)
            .unwrap_or(defaults.restore.system_root);
        if !system_root.is_absolute() {
            bail!("restore.system_root must be absolute");
        }
        let rollback_timeout = raw
            .restore
            .rollback_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.restore.rollback_timeout);
        let commit_timeout = raw
            .restore
            .commit_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.restore.commit_timeout);
        if rollback_timeout.is_zero() || commit_timeout.is_zero() {
            bail!("restore timeouts must be greater than zero");
        }
        if commit_timeout > rollback_timeout {
            bail!("restore.commit_timeout_secs must not exceed rollback_timeout_secs");
        }

        let probe_timeout = raw
            .network
            .probe_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.network.probe_timeout);
        if probe_timeout.is_zero() {
            bail!("network.probe_timeout_secs must be greater than zero");
        }

        Ok(Self {
            restore: RestoreCfg {
                work_base,
                system_root,
                rollback_timeout,
                commit_timeout,
            },
            network: NetworkCfg {
                probe_timeout,
                gateway_ping: raw.network.gateway_ping.unwrap_or(true),
                dns_resolve: raw.network.dns_resolve.unwrap_or(true),
                dns_test_host: trim_opt(raw.network.dns_test_host),
                local_ports: raw.network.local_ports.unwrap_or_default(),
            },
            registry: RegistryCfg {
                file: trim_opt(raw.registry.file).map(PathBuf::from),
            },
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct RestoreOut {
            work_base: String,
            system_root: String,
            rollback_timeout_secs: u64,
            commit_timeout_secs: u64,
        }
        #[derive(Serialize)]
        struct NetworkOut<'a> {
            probe_timeout_secs: u64,
            gateway_ping: bool,
            dns_resolve: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            dns_test_host: Option<&'a str>,
            local_ports: &'a [u16],
        }
        #[derive(Serialize)]
        struct RegistryOut {
            #[serde(skip_serializing_if = "Option::is_none")]
            file: Option<String>,
        }
        #[derive(Serialize)]
        struct Out<'a> {
            restore: RestoreOut,
            network: NetworkOut<'a>,
            registry: RegistryOut,
        }

        let out = Out {
            restore: RestoreOut {
                work_base: self.restore.work_base.display().to_string(),
                system_root: self.restore.system_root.display().to_string(),
                rollback_timeout_secs: self.restore.rollback_timeout.as_secs(),
                commit_timeout_secs: self.restore.commit_timeout.as_secs(),
            },
            network: NetworkOut {
                probe_timeout_secs: self.network.probe_timeout.as_secs(),
                gateway_ping: self.network.gateway_ping,
                dns_resolve: self.network.dns_resolve,
                dns_test_host: self.network.dns_test_host.as_deref(),
                local_ports: &self.network.local_ports,
            },
            registry: RegistryOut {
                file: self.registry.file.as_ref().map(|p| p.display().to_string()),
            },
        };
        Ok(toml::to_string_pretty(&out)?)
    }
}

fn trim_opt(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
