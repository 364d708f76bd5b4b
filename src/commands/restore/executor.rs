use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing as log;

use crate::AppCtx;
use crate::commands::restore::categories::{Category, SystemType, catalog};
use crate::commands::restore::extract::extract_selective;
use crate::commands::restore::health::{DNS_TEST_HOST_ENV, HealthOptions};
use crate::commands::restore::manifest::Manifest;
use crate::commands::restore::network::apply::{
    NetworkApplyDeps, NetworkApplyRequest, apply_network_with_rollback,
};
use crate::commands::restore::plan::{RestoreMode, RestorePlan, categories_for_mode, plan_restore};
use crate::commands::restore::scan::ScanController;
use crate::commands::restore::stage::{StageContext, reconcile};
use crate::errors::Aborted;
use crate::tooling::{pbs, pvesh, systemd};
use crate::ui::RestoreUi;
use crate::utils::bins::ensure_bins;
use crate::utils::cancel::Ctx;
use crate::utils::fs::Fs;
use crate::utils::lock::RunLock;
use crate::utils::process::CmdSpec;
use crate::utils::tempdir::{Registry, registry_path};

#[derive(Debug)]
pub struct RunOpts {
    pub archive: PathBuf,
    pub manifest: Option<PathBuf>,
    pub mode: RestoreMode,
    /// Explicit category ids for custom mode; empty asks the UI.
    pub categories: Vec<String>,
    pub assume_yes: bool,
}

pub fn restore_run(ctx: &Ctx, app: &AppCtx, ui: &dyn RestoreUi, mut opts: RunOpts) -> Result<()> {
    let _lock = RunLock::acquire("restore")?;

    opts.archive = pick_archive(ctx, app, ui, &opts.archive)?;
    let manifest = load_manifest(app, &opts)?;
    log::info!(
        "archive {} taken on '{}' ({} {}, script {}, encryption {:?}, created {})",
        manifest.archive_path.display(),
        manifest.hostname,
        manifest.proxmox_type.as_str(),
        manifest.proxmox_version,
        manifest.script_version,
        manifest.encryption_mode,
        crate::utils::time::fmt_utc(manifest.created_at).unwrap_or_default()
    );
    let system_type = resolve_system_type(app, ui, &manifest)?;

    let selected = select_categories(ui, system_type, opts.mode, &opts.categories)?;
    let mut plan = plan_restore(&manifest, &selected, system_type, opts.mode);
    if plan.is_empty() {
        bail!("nothing selected to restore");
    }
    if plan.needs_cluster_restore() && ui.select_cluster_safe_mode()? {
        plan.apply_cluster_safe_mode(true);
    }
    if plan.needs_pbs_services() {
        confirm_pbs_services(ctx, app, ui)?;
    }
    ensure_plan_bins(&plan)?;

    ui.show_restore_plan(&plan);
    if !opts.assume_yes && !ui.confirm_restore()? {
        return Err(anyhow!(Aborted("restore declined".into())));
    }

    let registry = Registry::open_with_base(
        &registry_path(app.cfg.registry.file.as_deref()),
        &app.cfg.restore.work_base,
    )?;
    // swept on the next run once this process is gone
    let work_dir = registry.register("restore")?;
    log::info!("working directory {}", work_dir.display());

    let stage_root = work_dir.join("stage");
    let export_root = work_dir.join("export");
    let system_root = app.cfg.restore.system_root.clone();

    ui.run_task(ctx, "extract", "unpacking selected categories", &|task_ctx, progress| {
        extract_bucket(task_ctx, app, &opts.archive, &plan.normal, &system_root, &work_dir, "normal")?;
        progress.update("normal categories extracted");
        extract_bucket(task_ctx, app, &opts.archive, &plan.staged, &stage_root, &work_dir, "staged")?;
        progress.update("staged categories extracted");
        extract_bucket(task_ctx, app, &opts.archive, &plan.export, &export_root, &work_dir, "export")?;
        progress.update("export categories extracted");
        Ok(())
    })?;

    let pvesh = app.tools.pvesh();
    let pbs = app.tools.pbs();
    let stage_deps = StageContext {
        fs: app.fs.as_ref(),
        pvesh: pvesh.as_ref(),
        pbs: pbs.as_ref(),
        system_root: &system_root,
    };
    let summary = reconcile(ctx, &stage_deps, &plan, &stage_root)?;
    for w in &summary.warnings {
        log::warn!("{w}");
    }
    if let Some(report) = &summary.secrets_report {
        ui.show_message(&format!(
            "regenerated credentials written to {}",
            report.display()
        ));
    }

    if plan.staged.iter().any(|c| c.id == "network") {
        apply_network(ctx, app, ui, &plan, &opts.archive, &stage_root, &work_dir, &system_root)?;
    }

    let mut done = format!(
        "restore finished: {} categor(ies) applied, {} staged change(s), {} warning(s)",
        plan.len(),
        summary.applied.len(),
        summary.warnings.len()
    );
    if !plan.export.is_empty() {
        done.push_str(&format!("; exported files under {}", export_root.display()));
    }
    done.push_str(&format!("; diagnostics under {}", work_dir.display()));
    ui.show_message(&done);
    Ok(())
}

/// A directory argument means "scan for candidate archives here and let
/// the user pick one"; slow remote mounts are the usual case. The scan
/// runs under the controller so a newer scan or an abort cancels it.
fn pick_archive(ctx: &Ctx, app: &AppCtx, ui: &dyn RestoreUi, path: &Path) -> Result<PathBuf> {
    let is_dir = app.fs.metadata(path).map(|m| m.is_dir()).unwrap_or(false);
    if !is_dir {
        return Ok(path.to_path_buf());
    }

    let controller = ScanController::new();
    let (scan_ctx, token) = controller.start(ctx);
    let mut candidates: Vec<PathBuf> = Vec::new();
    for entry in app.fs.read_dir(path)? {
        if scan_ctx.done() {
            controller.cancel();
            return Err(anyhow!(Aborted("archive scan cancelled".into())));
        }
        let name = entry.file_name().unwrap_or_default().to_string_lossy().into_owned();
        if name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            candidates.push(entry);
        }
    }
    controller.finish(token);

    if candidates.is_empty() {
        bail!("no archives found under {}", path.display());
    }
    candidates.sort();
    let names: Vec<String> = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let idx = ui.select_backup_candidate(&names)?;
    Ok(candidates
        .get(idx)
        .cloned()
        .ok_or_else(|| anyhow!("archive selection out of range"))?)
}

fn load_manifest(app: &AppCtx, opts: &RunOpts) -> Result<Manifest> {
    if let Some(path) = &opts.manifest {
        return Manifest::load(app.fs.as_ref(), path);
    }
    let sidecar = PathBuf::from(format!("{}.manifest.json", opts.archive.display()));
    if app.fs.exists(&sidecar) {
        return Manifest::load(app.fs.as_ref(), &sidecar);
    }
    Manifest::from_bundle(&opts.archive)
        .with_context(|| format!("no sidecar manifest next to {}", opts.archive.display()))
}

fn resolve_system_type(
    app: &AppCtx,
    ui: &dyn RestoreUi,
    manifest: &Manifest,
) -> Result<SystemType> {
    let detected = detect_system_type(app.fs.as_ref(), &app.cfg.restore.system_root);
    match (manifest.proxmox_type, detected) {
        (SystemType::Unknown, d) => Ok(d),
        (m, SystemType::Unknown) => Ok(m),
        (m, d) if m == d => Ok(m),
        (m, d) => {
            let err = format!(
                "archive was taken on {} but this host looks like {}",
                m.as_str(),
                d.as_str()
            );
            if ui.confirm_compatibility(&err)? {
                Ok(d)
            } else {
                Err(anyhow!(Aborted("incompatible archive".into())))
            }
        }
    }
}

pub fn detect_system_type(fs: &dyn Fs, system_root: &Path) -> SystemType {
    if fs.exists(&system_root.join("etc/pve")) {
        SystemType::Pve
    } else if fs.exists(&system_root.join("etc/proxmox-backup")) {
        SystemType::Pbs
    } else {
        SystemType::Unknown
    }
}

fn select_categories(
    ui: &dyn RestoreUi,
    system_type: SystemType,
    mode: RestoreMode,
    explicit: &[String],
) -> Result<Vec<Category>> {
    let all = catalog(system_type);
    if mode != RestoreMode::Custom {
        return Ok(categories_for_mode(mode, &all));
    }
    let ids = if explicit.is_empty() {
        ui.select_categories(&all, system_type)?
    } else {
        explicit.to_vec()
    };
    let mut out = Vec::with_capacity(ids.len());
    for id in &ids {
        let Some(c) = all.iter().find(|c| &c.id == id) else {
            bail!("unknown category '{id}' for {}", system_type.as_str());
        };
        out.push(c.clone());
    }
    Ok(out)
}

fn confirm_pbs_services(ctx: &Ctx, app: &AppCtx, ui: &dyn RestoreUi) -> Result<()> {
    let state = app
        .tools
        .systemd()
        .unit_state(ctx, "proxmox-backup-proxy.service");
    if state == "active" && !ui.confirm_continue_with_pbs_services_running()? {
        return Err(anyhow!(Aborted("pbs services running".into())));
    }
    Ok(())
}

/// Every CLI this plan will invoke must be present before anything
/// mutates the system; a partially-applied restore is worse than no
/// restore. `ifup`/`ifreload` are not gated here: preflight reports
/// Skipped without them and the reload chain falls back to systemctl.
fn ensure_plan_bins(plan: &RestorePlan) -> Result<()> {
    let mut all: BTreeSet<&'static str> = BTreeSet::new();
    all.insert("tar");
    all.insert("sh");

    let staged = |id: &str| plan.staged.iter().any(|c| c.id == id);
    if staged("pve_access_control") || staged("pve_notifications") || staged("pve_pools") {
        for b in pvesh::REQ_BINS {
            all.insert(b);
        }
    }
    if staged("pbs_access_control") {
        for b in pbs::REQ_BINS {
            all.insert(b);
        }
    }
    if staged("network") {
        for b in systemd::REQ_BINS {
            all.insert(b);
        }
    }

    ensure_bins(all)
}

fn extract_bucket(
    ctx: &Ctx,
    app: &AppCtx,
    archive: &Path,
    categories: &[Category],
    dest_root: &Path,
    work_dir: &Path,
    bucket: &str,
) -> Result<()> {
    if categories.is_empty() {
        return Ok(());
    }
    let report = extract_selective(
        ctx,
        app.fs.as_ref(),
        app.clock.as_ref(),
        archive,
        dest_root,
        work_dir,
        categories,
    )
    .with_context(|| format!("extract {bucket} categories"))?;
    log::info!(
        "{bucket}: {} entr(ies) applied, {} blocked, {} io error(s) ({})",
        report.applied,
        report.traversal_blocked + report.illegal,
        report.io_errors,
        report.log_path.display()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_network(
    ctx: &Ctx,
    app: &AppCtx,
    ui: &dyn RestoreUi,
    plan: &RestorePlan,
    archive: &Path,
    stage_root: &Path,
    work_dir: &Path,
    system_root: &Path,
) -> Result<()> {
    let snapshots = create_network_snapshots(ctx, app, work_dir, system_root);
    let (full, net_only) = match snapshots {
        Ok(pair) => pair,
        Err(e) => {
            if ui.confirm_continue_without_safety_backup(&format!("{e:#}"))? {
                log::warn!("continuing without network safety snapshot: {e:#}");
                return apply_without_rollback(app, stage_root, system_root);
            }
            return Err(e.context("network safety snapshot"));
        }
    };

    let systemd = app.tools.systemd();
    let ifupdown = app.tools.ifupdown();
    let deps = NetworkApplyDeps {
        runner: app.runner.as_ref(),
        fs: app.fs.as_ref(),
        clock: app.clock.as_ref(),
        systemd: systemd.as_ref(),
        ifupdown: ifupdown.as_ref(),
        system_root,
    };
    let req = NetworkApplyRequest {
        rollback_backup: &full,
        network_rollback: &net_only,
        stage_root: Some(stage_root),
        archive_path: archive,
        timeout: app.cfg.restore.rollback_timeout,
        system_type: plan.system_type,
        work_dir,
        health_options: health_options(app, plan.system_type),
    };
    apply_network_with_rollback(ctx, ui, &deps, &req)
}

/// Last resort when no snapshot could be taken: write the staged files and
/// leave reloading to the operator.
fn apply_without_rollback(app: &AppCtx, stage_root: &Path, system_root: &Path) -> Result<()> {
    let out = crate::commands::restore::stage::files::sync_dir_from_stage(
        app.fs.as_ref(),
        stage_root,
        system_root,
        "etc/network",
    )?;
    log::warn!(
        "network files written without a rollback window ({} applied); \
         reload networking manually once verified",
        out.applied.len()
    );
    Ok(())
}

fn health_options(app: &AppCtx, system_type: SystemType) -> HealthOptions {
    let mut opts = HealthOptions::for_system(system_type);
    opts.command_timeout = app.cfg.network.probe_timeout;
    opts.enable_gateway_ping = app.cfg.network.gateway_ping;
    opts.enable_dns_resolve = app.cfg.network.dns_resolve;
    // the env override wins over the config file
    if std::env::var(DNS_TEST_HOST_ENV).is_err()
        && let Some(host) = &app.cfg.network.dns_test_host
    {
        opts.dns_resolve_host = host.clone();
    }
    if !app.cfg.network.local_ports.is_empty() {
        opts.local_port_checks = app.cfg.network.local_ports.clone();
    }
    opts
}

fn create_network_snapshots(
    ctx: &Ctx,
    app: &AppCtx,
    work_dir: &Path,
    system_root: &Path,
) -> Result<(PathBuf, PathBuf)> {
    let full = work_dir.join("network_full_snapshot.tar.gz");
    let net_only = work_dir.join("network_only_snapshot.tar.gz");
    let root = system_root.display().to_string();

    let spec = CmdSpec::new("tar")
        .arg("-czf")
        .arg(full.display().to_string())
        .arg("--ignore-failed-read")
        .arg("-C")
        .arg(root.clone())
        .args(["etc/network", "etc/hosts", "etc/hostname", "etc/resolv.conf"]);
    app.runner
        .run_combined(ctx, &spec)
        .context("snapshot network companions")?;

    let spec = CmdSpec::new("tar")
        .arg("-czf")
        .arg(net_only.display().to_string())
        .arg("--ignore-failed-read")
        .arg("-C")
        .arg(root)
        .arg("etc/network");
    app.runner
        .run_combined(ctx, &spec)
        .context("snapshot network tree")?;

    Ok((full, net_only))
}

/// Print the computed plan without touching the system.
pub fn restore_plan(app: &AppCtx, ui: &dyn RestoreUi, opts: RunOpts) -> Result<()> {
    let manifest = load_manifest(app, &opts)?;
    let system_type = match manifest.proxmox_type {
        SystemType::Unknown => detect_system_type(app.fs.as_ref(), &app.cfg.restore.system_root),
        t => t,
    };
    let selected = select_categories(ui, system_type, opts.mode, &opts.categories)?;
    let plan = plan_restore(&manifest, &selected, system_type, opts.mode);
    ui.show_restore_plan(&plan);
    Ok(())
}

/// Reconcile the temp-dir registry: drop entries of dead processes.
pub fn registry_sweep(app: &AppCtx) -> Result<()> {
    let registry = Registry::open_with_base(
        &registry_path(app.cfg.registry.file.as_deref()),
        &app.cfg.restore.work_base,
    )?;
    let report = registry.sweep()?;
    log::info!(
        "sweep: {} removed, {} kept",
        report.removed.len(),
        report.kept
    );
    for p in report.removed {
        log::info!("  removed {}", p.display());
    }
    Ok(())
}
