use std::path::Path;

use anyhow::Result;

use crate::commands::restore::stage::sections::parse_sections;
use crate::commands::restore::stage::upsert::{upsert, with_id_flag};
use crate::tooling::pvesh::{Flag, PveshPort};
use crate::utils::cancel::Ctx;
use crate::utils::fs::Fs;

#[derive(Debug, Default)]
pub struct PoolsOutcome {
    pub applied: Vec<String>,
}

/// Re-issue staged resource pools through `pvesh`.
pub fn apply_pools_from_stage(
    ctx: &Ctx,
    pvesh: &dyn PveshPort,
    fs: &dyn Fs,
    stage_root: &Path,
) -> Result<PoolsOutcome> {
    let mut out = PoolsOutcome::default();
    let Ok(data) = fs.read(&stage_root.join("etc/pve/pools.cfg")) else {
        return Ok(out);
    };

    for section in parse_sections(&String::from_utf8_lossy(&data)) {
        if ctx.cancelled() {
            anyhow::bail!(crate::errors::Aborted("pools apply cancelled".into()));
        }
        if section.kind != "pool" {
            continue;
        }
        let flags: Vec<Flag> = section
            .entries
            .iter()
            .map(|(k, v)| Flag::new(k.clone(), v.clone()))
            .collect();
        let set_path = format!("/pools/{}", section.name);
        upsert(
            ctx,
            pvesh,
            &set_path,
            "/pools",
            &flags,
            with_id_flag("poolid", &section.name, &flags),
        )?;
        out.applied.push(set_path);
    }
    Ok(out)
}
