use anyhow::{Result, bail};

use crate::utils::ids::sanitize_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemType {
    Pve,
    Pbs,
    Unknown,
}

impl SystemType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pve" => Self::Pve,
            "pbs" => Self::Pbs,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pve => "pve",
            Self::Pbs => "pbs",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryKind {
    Common,
    Pve,
    Pbs,
}

/// A named bundle of path prefixes restored as one unit.
#[derive(Debug, Clone)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: CategoryKind,
    /// Relative POSIX path prefixes; normalized, no `./`, no `..`.
    pub paths: Vec<String>,
    /// Exported to a side directory instead of written to live paths.
    pub export_only: bool,
    /// Extracted into the staging root instead of directly onto `/`.
    pub staged: bool,
}

/// Category ids that always go through the staging root.
pub const STAGED_IDS: &[&str] = &[
    "network",
    "pve_access_control",
    "pbs_access_control",
    "pve_notifications",
    "pve_ha",
    "pve_sdn",
    "pve_pools",
];

impl Category {
    pub fn new(
        id: &str,
        name: &str,
        description: &str,
        kind: CategoryKind,
        paths: &[&str],
    ) -> Result<Self> {
        let id = sanitize_id(id);
        let mut norm = Vec::with_capacity(paths.len());
        for p in paths {
            norm.push(normalize_rel_path(p)?);
        }
        let staged = STAGED_IDS.contains(&id.as_str());
        Ok(Self {
            id,
            name: name.to_string(),
            description: description.to_string(),
            kind,
            paths: norm,
            export_only: false,
            staged,
        })
    }

    pub fn export_only(mut self) -> Self {
        self.export_only = true;
        self
    }

    pub fn applies_to(&self, system: SystemType) -> bool {
        match self.kind {
            CategoryKind::Common => true,
            CategoryKind::Pve => system == SystemType::Pve,
            CategoryKind::Pbs => system == SystemType::Pbs,
        }
    }
}

/// Normalize a category path to a strictly relative POSIX form: leading
/// `./` and `/` stripped, empty and `..` components rejected.
pub fn normalize_rel_path(p: &str) -> Result<String> {
    let mut s = p.trim();
    while let Some(rest) = s.strip_prefix("./") {
        s = rest;
    }
    s = s.trim_start_matches('/');
    let components: Vec<&str> = s.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    if components.is_empty() {
        bail!("category path is empty after normalization: {p:?}");
    }
    if components.iter().any(|c| *c == "..") {
        bail!("category path must not contain '..': {p:?}");
    }
    Ok(components.join("/"))
}

/// Built-in catalog for a given system type.
pub fn catalog(system: SystemType) -> Vec<Category> {
    let mut all = vec![
        Category::new(
            "network",
            "Network",
            "Interfaces and network stack configuration",
            CategoryKind::Common,
            &["./etc/network/"],
        ),
        Category::new(
            "system_base",
            "Base system",
            "Hostname, hosts and resolver files",
            CategoryKind::Common,
            &["./etc/hostname", "./etc/hosts", "./etc/resolv.conf"],
        ),
        Category::new(
            "pve_cluster",
            "PVE cluster",
            "Corosync and pmxcfs database",
            CategoryKind::Pve,
            &["./etc/pve/corosync.conf", "./var/lib/pve-cluster/"],
        ),
        Category::new(
            "pve_storage",
            "PVE storage",
            "Storage definitions",
            CategoryKind::Pve,
            &["./etc/pve/storage.cfg"],
        ),
        Category::new(
            "pve_guests",
            "PVE guests",
            "VM and container configuration",
            CategoryKind::Pve,
            &["./etc/pve/nodes/"],
        ),
        Category::new(
            "pve_firewall",
            "PVE firewall",
            "Cluster and host firewall rules",
            CategoryKind::Pve,
            &["./etc/pve/firewall/"],
        ),
        Category::new(
            "pve_jobs",
            "PVE jobs",
            "Backup and replication jobs",
            CategoryKind::Pve,
            &["./etc/pve/jobs.cfg"],
        ),
        Category::new(
            "pve_ha",
            "PVE HA",
            "High availability resources and groups",
            CategoryKind::Pve,
            &["./etc/pve/ha/"],
        ),
        Category::new(
            "pve_sdn",
            "PVE SDN",
            "Software defined networking",
            CategoryKind::Pve,
            &["./etc/pve/sdn/"],
        ),
        Category::new(
            "pve_access_control",
            "PVE access control",
            "Users, groups, roles, ACLs and API tokens",
            CategoryKind::Pve,
            &[
                "./etc/pve/user.cfg",
                "./etc/pve/domains.cfg",
                "./etc/pve/priv/token.cfg",
            ],
        ),
        Category::new(
            "pve_notifications",
            "PVE notifications",
            "Notification endpoints and matchers",
            CategoryKind::Pve,
            &["./etc/pve/notifications.cfg", "./etc/pve/priv/notifications.cfg"],
        ),
        Category::new(
            "pve_pools",
            "PVE pools",
            "Resource pools",
            CategoryKind::Pve,
            &["./etc/pve/pools.cfg"],
        ),
        Category::new(
            "pbs_access_control",
            "PBS access control",
            "Users, tokens, TFA and ACLs",
            CategoryKind::Pbs,
            &[
                "./etc/proxmox-backup/user.cfg",
                "./etc/proxmox-backup/domains.cfg",
                "./etc/proxmox-backup/acl.cfg",
                "./etc/proxmox-backup/shadow.json",
                "./etc/proxmox-backup/token.shadow",
                "./etc/proxmox-backup/tfa.json",
            ],
        ),
        Category::new(
            "pbs_datastores",
            "PBS datastores",
            "Datastore definitions",
            CategoryKind::Pbs,
            &["./etc/proxmox-backup/datastore.cfg"],
        ),
        Category::new(
            "pbs_jobs",
            "PBS jobs",
            "Sync, verify and prune jobs",
            CategoryKind::Pbs,
            &[
                "./etc/proxmox-backup/remote.cfg",
                "./etc/proxmox-backup/sync.cfg",
                "./etc/proxmox-backup/verification.cfg",
                "./etc/proxmox-backup/prune.cfg",
            ],
        ),
    ];

    let mut out = Vec::new();
    for c in all.drain(..) {
        let c = c.expect("built-in category is valid");
        if c.applies_to(system) {
            out.push(c);
        }
    }
    out
}

pub fn find<'a>(categories: &'a [Category], id: &str) -> Option<&'a Category> {
    categories.iter().find(|c| c.id == id)
}
