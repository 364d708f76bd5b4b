pub mod access;
pub mod files;
pub mod notifications;
pub mod pbs;
pub mod pools;
pub mod sections;
pub mod upsert;

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing as log;

use crate::commands::restore::categories::SystemType;
use crate::commands::restore::plan::RestorePlan;
use crate::tooling::pbs::PbsManagerPort;
use crate::tooling::pvesh::PveshPort;
use crate::utils::cancel::Ctx;
use crate::utils::fs::Fs;

pub struct StageContext<'a> {
    pub fs: &'a dyn Fs,
    pub pvesh: &'a dyn PveshPort,
    pub pbs: &'a dyn PbsManagerPort,
    /// `/` in production; tests point it into a tempdir.
    pub system_root: &'a Path,
}

#[derive(Debug, Default)]
pub struct StageSummary {
    pub applied: Vec<String>,
    pub warnings: Vec<String>,
    pub secrets_report: Option<PathBuf>,
}

/// Apply every staged family present in the plan, in a fixed order:
/// HA, SDN, access control, notifications, pools. The `network` category
/// is deliberately absent here; it goes through the apply pipeline with
/// its rollback window.
pub fn reconcile(
    ctx: &Ctx,
    deps: &StageContext<'_>,
    plan: &RestorePlan,
    stage_root: &Path,
) -> Result<StageSummary> {
    let mut summary = StageSummary::default();
    let staged = |id: &str| plan.staged.iter().any(|c| c.id == id);

    if plan.system_type == SystemType::Pve {
        if staged("pve_ha") {
            let out = files::sync_dir_from_stage(deps.fs, stage_root, deps.system_root, "etc/pve/ha")?;
            record_sync(&mut summary, "pve_ha", out);
        }
        if staged("pve_sdn") {
            let out =
                files::sync_dir_from_stage(deps.fs, stage_root, deps.system_root, "etc/pve/sdn")?;
            record_sync(&mut summary, "pve_sdn", out);
        }
        if staged("pve_access_control") {
            let out = access::apply_access_control_from_stage(ctx, deps.pvesh, deps.fs, stage_root)?;
            summary.applied.extend(out.applied);
            summary.warnings.extend(out.warnings);
            summary.secrets_report = out.secrets_report;
        }
        if staged("pve_notifications") {
            let out =
                notifications::apply_notifications_from_stage(ctx, deps.pvesh, deps.fs, stage_root)?;
            summary.applied.extend(out.applied);
        }
        if staged("pve_pools") {
            let out = pools::apply_pools_from_stage(ctx, deps.pvesh, deps.fs, stage_root)?;
            summary.applied.extend(out.applied);
        }
    }

    if plan.system_type == SystemType::Pbs && staged("pbs_access_control") {
        let out = pbs::apply_pbs_access_from_stage(
            ctx,
            deps.pbs,
            deps.fs,
            stage_root,
            deps.system_root,
        )?;
        summary
            .applied
            .extend(out.applied.iter().map(|p| p.display().to_string()));
        summary.warnings.extend(out.warnings);
    }

    if !summary.warnings.is_empty() {
        log::warn!(
            "staged reconciliation finished with {} warning(s)",
            summary.warnings.len()
        );
    }
    Ok(summary)
}

fn record_sync(summary: &mut StageSummary, family: &str, out: files::SyncOutcome) {
    summary.applied.extend(
        out.applied
            .iter()
            .map(|p| format!("{family}: {}", p.display())),
    );
    for p in &out.pruned {
        log::info!("{family}: pruned {}", p.display());
    }
    summary.warnings.extend(out.warnings);
}
