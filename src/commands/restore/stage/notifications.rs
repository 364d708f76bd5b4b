use std::path::Path;

use anyhow::Result;
use tracing as log;

use crate::commands::restore::stage::sections::{Section, parse_sections};
use crate::commands::restore::stage::upsert::{upsert, with_id_flag};
use crate::tooling::pvesh::{Flag, PveshPort};
use crate::utils::cancel::Ctx;
use crate::utils::fs::Fs;

/// Notification endpoint kinds carried in `notifications.cfg`; anything
/// else under that header namespace is a matcher.
const ENDPOINT_KINDS: &[&str] = &["sendmail", "smtp", "gotify", "webhook"];

/// Keys in the private companion file whose values are secrets.
const PRIV_SECRET_KEYS: &[&str] = &["token", "password", "secret"];

#[derive(Debug, Default)]
pub struct NotificationsOutcome {
    pub applied: Vec<String>,
}

/// Re-issue staged notification endpoints and matchers through `pvesh`.
/// `priv/notifications.cfg` carries the secret halves (tokens, passwords);
/// its entries are merged into the matching public section as secret flags.
pub fn apply_notifications_from_stage(
    ctx: &Ctx,
    pvesh: &dyn PveshPort,
    fs: &dyn Fs,
    stage_root: &Path,
) -> Result<NotificationsOutcome> {
    let mut out = NotificationsOutcome::default();

    let public = read(fs, &stage_root.join("etc/pve/notifications.cfg"));
    if public.is_empty() {
        return Ok(out);
    }
    let private = read(fs, &stage_root.join("etc/pve/priv/notifications.cfg"));

    for section in &public {
        if ctx.cancelled() {
            anyhow::bail!(crate::errors::Aborted("notifications apply cancelled".into()));
        }
        let mut flags: Vec<Flag> = section
            .entries
            .iter()
            .map(|(k, v)| Flag::new(k.clone(), v.clone()))
            .collect();
        if let Some(secret) = private
            .iter()
            .find(|p| p.kind == section.kind && p.name == section.name)
        {
            for (k, v) in &secret.entries {
                if PRIV_SECRET_KEYS.contains(&k.as_str()) {
                    flags.push(Flag::secret(k.clone(), v.clone()));
                } else {
                    flags.push(Flag::new(k.clone(), v.clone()));
                }
            }
        }

        let (set_path, create_path) = routes(section);
        upsert(
            ctx,
            pvesh,
            &set_path,
            &create_path,
            &flags,
            with_id_flag("name", &section.name, &flags),
        )?;
        out.applied.push(set_path);
    }

    if !private.is_empty() {
        log::debug!("merged {} private notification section(s)", private.len());
    }
    Ok(out)
}

fn routes(section: &Section) -> (String, String) {
    if ENDPOINT_KINDS.contains(&section.kind.as_str()) {
        (
            format!(
                "/cluster/notifications/endpoints/{}/{}",
                section.kind, section.name
            ),
            format!("/cluster/notifications/endpoints/{}", section.kind),
        )
    } else {
        (
            format!("/cluster/notifications/matchers/{}", section.name),
            "/cluster/notifications/matchers".to_string(),
        )
    }
}

fn read(fs: &dyn Fs, path: &Path) -> Vec<Section> {
    match fs.read(path) {
        Ok(data) => parse_sections(&String::from_utf8_lossy(&data)),
        Err(_) => Vec::new(),
    }
}
