use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Result, bail};

/// Verify every CLI the computed restore plan will invoke, before anything
/// mutates the system. The missing set is reported in one shot so the
/// operator fixes PATH once, not binary by binary.
pub fn ensure_bins<I, S>(bins: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut missing: Vec<String> = Vec::new();
    for b in bins {
        let b = b.as_ref();
        if which(b).is_none() {
            missing.push(b.to_string());
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();
    missing.dedup();
    bail!(
        "restore needs binaries missing from PATH: {}",
        missing.join(", ")
    );
}

pub fn which(bin: &str) -> Option<PathBuf> {
    let direct = Path::new(bin);
    if direct.is_absolute() {
        return executable(direct).then(|| direct.to_path_buf());
    }
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(bin))
        .find(|cand| executable(cand))
}

fn executable(p: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(p) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
