use anyhow::{Context, Result, anyhow};
use tracing as log;

use crate::errors::CmdFailed;
use crate::tooling::pvesh::{Flag, PveshPort};
use crate::utils::cancel::Ctx;

pub enum UpsertResult {
    Updated,
    Created(Vec<u8>),
}

/// Try `set` first; when the resource does not exist yet, retry as
/// `create`. Error strings have every secret value redacted.
pub fn upsert(
    ctx: &Ctx,
    pvesh: &dyn PveshPort,
    set_path: &str,
    create_path: &str,
    set_flags: &[Flag],
    create_flags: Vec<Flag>,
) -> Result<UpsertResult> {
    let mut secrets = secret_values(set_flags);
    secrets.extend(secret_values(&create_flags));

    match pvesh.set(ctx, set_path, set_flags) {
        Ok(_) => Ok(UpsertResult::Updated),
        Err(e) if is_not_found(&e) => {
            log::debug!("{set_path} missing, creating");
            let out = pvesh
                .create(ctx, create_path, &create_flags)
                .map_err(|err| redact_error(err, &secrets))
                .with_context(|| format!("create {create_path}"))?;
            Ok(UpsertResult::Created(out))
        }
        Err(e) => Err(redact_error(e, &secrets).context(format!("update {set_path}"))),
    }
}

/// The concrete wording varies per CLI; match the usual suspects.
pub fn is_not_found(e: &anyhow::Error) -> bool {
    let Some(failed) = e.downcast_ref::<CmdFailed>() else {
        return false;
    };
    let text = failed.output_text().to_lowercase();
    ["not found", "does not exist", "no such"]
        .iter()
        .any(|n| text.contains(n))
}

pub fn secret_values(flags: &[Flag]) -> Vec<String> {
    flags
        .iter()
        .filter(|f| f.secret && !f.value.is_empty())
        .map(|f| f.value.clone())
        .collect()
}

/// Flatten the error chain and blank out every known secret value.
pub fn redact_error(e: anyhow::Error, secrets: &[String]) -> anyhow::Error {
    let mut msg = format!("{e:#}");
    for s in secrets {
        msg = msg.replace(s, "<redacted>");
    }
    anyhow!(msg)
}

/// Prepend the create-side identifier flag.
pub fn with_id_flag(id_key: &str, name: &str, flags: &[Flag]) -> Vec<Flag> {
    let mut out = Vec::with_capacity(flags.len() + 1);
    out.push(Flag::new(id_key, name));
    out.extend(flags.iter().cloned());
    out
}
