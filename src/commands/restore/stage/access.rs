use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing as log;

use crate::commands::restore::stage::sections::{Section, parse_sections};
use crate::commands::restore::stage::upsert::{
    UpsertResult, redact_error, secret_values, upsert, with_id_flag,
};
use crate::tooling::pvesh::{Flag, PveshPort};
use crate::utils::cancel::Ctx;
use crate::utils::fs::Fs;

/// Keys whose values are secrets; their values never appear in logs or
/// error strings.
pub const SECRET_KEYS: &[&str] = &["password", "secret", "token", "key"];

const SECRETS_REPORT: &str = "pve_access_control_secrets.json";

#[derive(Debug, Default)]
pub struct AccessOutcome {
    pub applied: Vec<String>,
    pub warnings: Vec<String>,
    pub secrets_report: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize)]
struct SecretsReport {
    users: BTreeMap<String, String>,
    tokens: BTreeMap<String, String>,
}

impl SecretsReport {
    fn is_empty(&self) -> bool {
        self.users.is_empty() && self.tokens.is_empty()
    }
}

/// Re-issue staged PVE access control (realms, roles, groups, users, API
/// tokens, ACLs) through `pvesh` with upsert semantics. Tokens are always
/// handled before ACLs so ACL entries referencing them resolve.
pub fn apply_access_control_from_stage(
    ctx: &Ctx,
    pvesh: &dyn PveshPort,
    fs: &dyn Fs,
    stage_root: &Path,
) -> Result<AccessOutcome> {
    let mut out = AccessOutcome::default();
    let mut report = SecretsReport::default();

    let mut sections =
        read_sections(fs, &stage_root.join("etc/pve/domains.cfg"), realm_order);
    sections.extend(read_sections(
        fs,
        &stage_root.join("etc/pve/user.cfg"),
        user_cfg_order,
    ));
    if sections.is_empty() {
        return Ok(out);
    }
    sections.sort_by_key(|(order, _)| *order);

    for (_, section) in sections {
        if ctx.cancelled() {
            anyhow::bail!(crate::errors::Aborted("access control apply cancelled".into()));
        }
        match apply_section(ctx, pvesh, &section, &mut report) {
            Ok(Some(path)) => out.applied.push(path),
            Ok(None) => {}
            Err(e) => return Err(e),
        }
    }

    if !report.is_empty() {
        let path = stage_root.join(SECRETS_REPORT);
        let body = serde_json::to_vec_pretty(&report)?;
        fs.write(&path, &body, 0o600)
            .with_context(|| format!("write secrets report {}", path.display()))?;
        log::info!(
            "wrote regenerated credentials for {} user(s) and {} token(s) to {}",
            report.users.len(),
            report.tokens.len(),
            path.display()
        );
        out.secrets_report = Some(path);
    }

    Ok(out)
}

fn read_sections(
    fs: &dyn Fs,
    path: &Path,
    order: fn(&Section) -> Option<u8>,
) -> Vec<(u8, Section)> {
    let Ok(data) = fs.read(path) else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&data);
    let mut out = Vec::new();
    for s in parse_sections(&text) {
        match order(&s) {
            Some(o) => out.push((o, s)),
            None => log::warn!("skipping unknown section kind {:?} in {}", s.kind, path.display()),
        }
    }
    out
}

// Realms first, then roles, groups, users, tokens, ACLs last.
fn realm_order(_s: &Section) -> Option<u8> {
    Some(0)
}

fn user_cfg_order(s: &Section) -> Option<u8> {
    match s.kind.as_str() {
        "role" => Some(1),
        "group" => Some(2),
        "user" => Some(3),
        "token" => Some(4),
        "acl" => Some(5),
        _ => None,
    }
}

fn apply_section(
    ctx: &Ctx,
    pvesh: &dyn PveshPort,
    section: &Section,
    report: &mut SecretsReport,
) -> Result<Option<String>> {
    let flags = section_flags(section);

    match section.kind.as_str() {
        "role" => upsert(
            ctx,
            pvesh,
            &format!("/access/roles/{}", section.name),
            "/access/roles",
            &flags,
            with_id_flag("roleid", &section.name, &flags),
        )
        .map(|_| Some(format!("/access/roles/{}", section.name))),
        "group" => upsert(
            ctx,
            pvesh,
            &format!("/access/groups/{}", section.name),
            "/access/groups",
            &flags,
            with_id_flag("groupid", &section.name, &flags),
        )
        .map(|_| Some(format!("/access/groups/{}", section.name))),
        "user" => apply_user(ctx, pvesh, section, flags, report),
        "token" => apply_token(ctx, pvesh, section, flags, report),
        "acl" => apply_acl(ctx, pvesh, section, flags),
        // domains.cfg: the section kind is the realm type
        _ => {
            let mut create = with_id_flag("realm", &section.name, &flags);
            create.insert(1, Flag::new("type", section.kind.clone()));
            upsert(
                ctx,
                pvesh,
                &format!("/access/domains/{}", section.name),
                "/access/domains",
                &flags,
                create,
            )
            .map(|_| Some(format!("/access/domains/{}", section.name)))
        }
    }
}

fn apply_user(
    ctx: &Ctx,
    pvesh: &dyn PveshPort,
    section: &Section,
    flags: Vec<Flag>,
    report: &mut SecretsReport,
) -> Result<Option<String>> {
    let user_id = section.name.as_str();
    let set_path = format!("/access/users/{user_id}");
    let mut create = with_id_flag("userid", user_id, &flags);

    // A local-realm user recreated without a password gets a generated one
    // so the account stays usable; the value lands in the secrets report.
    let mut generated: Option<String> = None;
    if user_id.ends_with("@pve") && !section.has("password") {
        let pw = generate_password();
        create.push(Flag::secret("password", pw.clone()));
        generated = Some(pw);
    }

    match upsert(ctx, pvesh, &set_path, "/access/users", &flags, create)? {
        UpsertResult::Created(_) => {
            if let Some(pw) = generated {
                report.users.insert(user_id.to_string(), pw);
            }
        }
        UpsertResult::Updated => {}
    }
    Ok(Some(set_path))
}

fn apply_token(
    ctx: &Ctx,
    pvesh: &dyn PveshPort,
    section: &Section,
    flags: Vec<Flag>,
    report: &mut SecretsReport,
) -> Result<Option<String>> {
    let Some((user_id, token_id)) = section.name.split_once('!') else {
        log::warn!("skipping token section with malformed id {:?}", section.name);
        return Ok(None);
    };
    let path = format!("/access/users/{user_id}/token/{token_id}");

    match upsert(ctx, pvesh, &path, &path, &flags, flags.clone())? {
        UpsertResult::Created(output) => {
            // token creation returns the regenerated secret value
            if let Some(value) = token_value(&output) {
                report.tokens.insert(section.name.clone(), value);
            }
        }
        UpsertResult::Updated => {}
    }
    Ok(Some(path))
}

fn apply_acl(
    ctx: &Ctx,
    pvesh: &dyn PveshPort,
    section: &Section,
    flags: Vec<Flag>,
) -> Result<Option<String>> {
    // /access/acl has pure set semantics; the section name is the ACL path
    let mut all = vec![Flag::new("path", section.name.clone())];
    all.extend(flags);
    let secrets = secret_values(&all);
    pvesh
        .set(ctx, "/access/acl", &all)
        .map_err(|e| redact_error(e, &secrets))
        .with_context(|| format!("apply acl {}", section.name))?;
    Ok(Some(format!("/access/acl {}", section.name)))
}

fn section_flags(section: &Section) -> Vec<Flag> {
    section
        .entries
        .iter()
        .map(|(k, v)| {
            if SECRET_KEYS.contains(&k.as_str()) {
                Flag::secret(k.clone(), v.clone())
            } else {
                Flag::new(k.clone(), v.clone())
            }
        })
        .collect()
}

fn token_value(output: &[u8]) -> Option<String> {
    let v: serde_json::Value = serde_json::from_slice(output).ok()?;
    v.get("value")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
}

fn generate_password() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
    let mut rng = rand::rng();
    loop {
        let pw: String = (0..24)
            .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
            .collect();
        let lower = pw.bytes().any(|b| b.is_ascii_lowercase());
        let upper = pw.bytes().any(|b| b.is_ascii_uppercase());
        let digit = pw.bytes().any(|b| b.is_ascii_digit());
        if lower && upper && digit {
            return pw;
        }
    }
}
