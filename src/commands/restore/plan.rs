use crate::commands::restore::categories::{Category, SystemType};
use crate::commands::restore::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Full,
    Storage,
    Base,
    Custom,
}

impl RestoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Storage => "storage",
            Self::Base => "base",
            Self::Custom => "custom",
        }
    }
}

/// Pure split of the selection into the three disjoint buckets. The plan
/// holds copies of the categories and is only mutated through
/// [`RestorePlan::apply_cluster_safe_mode`].
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub mode: RestoreMode,
    pub system_type: SystemType,
    pub normal: Vec<Category>,
    pub staged: Vec<Category>,
    pub export: Vec<Category>,
    cluster_safe_mode: bool,
}

/// Subset of the catalog a non-custom mode restores. Custom mode selects
/// nothing here; the caller asks the user instead.
pub fn categories_for_mode(mode: RestoreMode, all: &[Category]) -> Vec<Category> {
    match mode {
        RestoreMode::Full => all.to_vec(),
        RestoreMode::Storage => by_ids(all, &["pve_storage", "pbs_datastores", "pbs_jobs"]),
        RestoreMode::Base => by_ids(all, &["network", "system_base"]),
        RestoreMode::Custom => Vec::new(),
    }
}

fn by_ids(all: &[Category], ids: &[&str]) -> Vec<Category> {
    all.iter()
        .filter(|c| ids.contains(&c.id.as_str()))
        .cloned()
        .collect()
}

pub fn plan_restore(
    _manifest: &Manifest,
    selected: &[Category],
    system_type: SystemType,
    mode: RestoreMode,
) -> RestorePlan {
    let mut normal = Vec::new();
    let mut staged = Vec::new();
    let mut export = Vec::new();
    for c in selected {
        if c.export_only {
            export.push(c.clone());
        } else if c.staged {
            staged.push(c.clone());
        } else {
            normal.push(c.clone());
        }
    }
    RestorePlan {
        mode,
        system_type,
        normal,
        staged,
        export,
        cluster_safe_mode: false,
    }
}

impl RestorePlan {
    pub fn cluster_safe_mode(&self) -> bool {
        self.cluster_safe_mode
    }

    /// Redirect `pve_cluster` between the normal and export buckets.
    /// Idempotent in both directions; only meaningful on PVE.
    pub fn apply_cluster_safe_mode(&mut self, enabled: bool) {
        self.cluster_safe_mode = enabled;
        if self.system_type != SystemType::Pve {
            return;
        }
        if enabled {
            if let Some(pos) = self.normal.iter().position(|c| c.id == "pve_cluster") {
                self.export.push(self.normal.remove(pos));
            }
        } else if let Some(pos) = self.export.iter().position(|c| c.id == "pve_cluster") {
            self.normal.insert(0, self.export.remove(pos));
        }
    }

    pub fn has_category_id(&self, id: &str) -> bool {
        self.normal
            .iter()
            .chain(self.staged.iter())
            .chain(self.export.iter())
            .any(|c| c.id == id)
    }

    pub fn needs_cluster_restore(&self) -> bool {
        self.system_type == SystemType::Pve
            && self.normal.iter().any(|c| c.id == "pve_cluster")
    }

    pub fn needs_pbs_services(&self) -> bool {
        self.system_type == SystemType::Pbs
            && self
                .normal
                .iter()
                .chain(self.staged.iter())
                .any(|c| c.id.starts_with("pbs_"))
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.staged.is_empty() && self.export.is_empty()
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.staged.len() + self.export.len()
    }
}
