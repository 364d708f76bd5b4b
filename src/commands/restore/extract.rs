use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use flate2::read::MultiGzDecoder;
use tracing as log;

use crate::commands::restore::categories::Category;
use crate::errors::{Aborted, ArchiveMalformed};
use crate::utils::cancel::Ctx;
use crate::utils::clock::Clock;
use crate::utils::fs::Fs;

const DIR_MODE: u32 = 0o755;
const LOG_MODE: u32 = 0o600;

#[derive(Debug)]
pub struct ExtractReport {
    pub applied: usize,
    pub traversal_blocked: usize,
    pub illegal: usize,
    pub io_errors: usize,
    pub log_path: PathBuf,
}

/// Extract every entry of the archive into `dest_root`.
pub fn extract_full(
    ctx: &Ctx,
    fs: &dyn Fs,
    clock: &dyn Clock,
    archive: &Path,
    dest_root: &Path,
    log_dir: &Path,
) -> Result<ExtractReport> {
    extract(ctx, fs, clock, archive, dest_root, log_dir, None)
}

/// Extract only entries covered by the given categories' path prefixes.
pub fn extract_selective(
    ctx: &Ctx,
    fs: &dyn Fs,
    clock: &dyn Clock,
    archive: &Path,
    dest_root: &Path,
    log_dir: &Path,
    categories: &[Category],
) -> Result<ExtractReport> {
    extract(ctx, fs, clock, archive, dest_root, log_dir, Some(categories))
}

fn extract(
    ctx: &Ctx,
    fs: &dyn Fs,
    clock: &dyn Clock,
    archive: &Path,
    dest_root: &Path,
    log_dir: &Path,
    filter: Option<&[Category]>,
) -> Result<ExtractReport> {
    if dest_root.as_os_str().is_empty() {
        bail!("extraction destination must not be empty");
    }
    let strict = filter.is_none();
    if dest_root == Path::new("/") && !effective_root() {
        bail!(
            "refusing to extract {} over / without root privileges",
            archive.display()
        );
    }

    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let reader = open_reader(archive, file)?;
    let mut tar = tar::Archive::new(reader);

    let mut recorder = Recorder::default();
    let entries = tar
        .entries()
        .map_err(|e| anyhow!(ArchiveMalformed(format!("{}: {e}", archive.display()))))?;

    for entry in entries {
        if ctx.cancelled() {
            let _ = recorder.flush(fs, clock, log_dir);
            return Err(anyhow!(Aborted("extraction cancelled".into())));
        }
        let mut entry =
            entry.map_err(|e| anyhow!(ArchiveMalformed(format!("{}: {e}", archive.display()))))?;
        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let kind = entry.header().entry_type();

        let cleaned = match sanitize_entry_name(&raw_name) {
            Ok(c) => c,
            Err(Reject::Traversal) => {
                log::warn!("blocked path traversal in archive entry {raw_name:?}");
                recorder.record("path_traversal", "-", &raw_name, 0);
                continue;
            }
            Err(Reject::Illegal) => {
                recorder.record("illegal_path", "-", &raw_name, 0);
                continue;
            }
        };

        use tar::EntryType;
        let is_dir = kind == EntryType::Directory;
        if let Some(categories) = filter
            && !selected(&cleaned, is_dir, categories)
        {
            continue;
        }

        let target = dest_root.join(&cleaned);
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let size = entry.header().size().unwrap_or(0);

        let applied = match kind {
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                apply_file(fs, &mut entry, &target, mode)
            }
            EntryType::Directory => fs.mkdir_all(&target, mode),
            EntryType::Symlink => apply_symlink(fs, &entry, dest_root, &cleaned, &target),
            EntryType::Link => apply_hardlink(fs, &entry, dest_root, &target),
            // devices, FIFOs and friends are silently skipped
            _ => continue,
        };

        match applied {
            Ok(()) => {
                restore_attrs(fs, &entry, &target, kind);
                recorder.record("applied", type_label(kind), &cleaned, size);
            }
            Err(e) if is_traversal(&e) => {
                log::warn!("blocked link escape in archive entry {cleaned:?}");
                recorder.record("path_traversal", type_label(kind), &cleaned, size);
            }
            Err(e) => {
                recorder.record("io_error", type_label(kind), &cleaned, size);
                if strict {
                    let _ = recorder.flush(fs, clock, log_dir);
                    return Err(e.context(format!("extract {cleaned}")));
                }
                log::warn!("extract {cleaned}: {e:#}");
            }
        }
    }

    let log_path = recorder.flush(fs, clock, log_dir)?;
    Ok(ExtractReport {
        applied: recorder.applied,
        traversal_blocked: recorder.traversal,
        illegal: recorder.illegal,
        io_errors: recorder.io_errors,
        log_path,
    })
}

fn open_reader(path: &Path, file: File) -> Result<Box<dyn Read>> {
    let mut magic = [0u8; 2];
    let mut probe = File::open(path)?;
    let gz = match probe.read(&mut magic) {
        Ok(2) => magic == [0x1f, 0x8b],
        _ => false,
    };
    if gz {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

enum Reject {
    Illegal,
    Traversal,
}

/// Clean an entry name into a safe relative path.
fn sanitize_entry_name(raw: &str) -> std::result::Result<String, Reject> {
    let name = raw.replace('\\', "/");
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == "./" {
        return Err(Reject::Illegal);
    }
    if trimmed.starts_with('/') {
        return Err(Reject::Illegal);
    }
    let components: Vec<&str> = trimmed
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if components.is_empty() {
        return Err(Reject::Illegal);
    }
    if components.iter().any(|c| *c == "..") {
        return Err(Reject::Traversal);
    }
    Ok(components.join("/"))
}

/// Directory-wise prefix match against any category path.
fn selected(cleaned: &str, is_dir: bool, categories: &[Category]) -> bool {
    let name: Vec<&str> = cleaned.split('/').collect();
    for cat in categories {
        for p in &cat.paths {
            let prefix: Vec<&str> = p.split('/').collect();
            if name.len() >= prefix.len() && name[..prefix.len()] == prefix[..] {
                return true;
            }
            // ancestors of a selected prefix are needed to hold it
            if is_dir && prefix.len() > name.len() && prefix[..name.len()] == name[..] {
                return true;
            }
        }
    }
    false
}

fn apply_file(fs: &dyn Fs, entry: &mut tar::Entry<'_, impl Read>, target: &Path, mode: u32) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs.mkdir_all(parent, DIR_MODE)?;
    }
    // never write through a pre-existing symlink
    if let Ok(meta) = fs.symlink_metadata(target)
        && meta.is_symlink()
    {
        fs.remove_file(target)?;
    }
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    fs.write(target, &data, mode)
}

fn apply_symlink(
    fs: &dyn Fs,
    entry: &tar::Entry<'_, impl Read>,
    dest_root: &Path,
    cleaned: &str,
    target: &Path,
) -> Result<()> {
    let link = entry
        .link_name_bytes()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    if link.is_empty() {
        bail!("symlink entry {cleaned} has no target");
    }
    if resolve_link(dest_root, cleaned, &link).is_none() {
        return Err(anyhow!(LinkEscape(link)));
    }
    if let Some(parent) = target.parent() {
        fs.mkdir_all(parent, DIR_MODE)?;
    }
    // replace whatever sits there; never follow an existing symlink
    if let Ok(meta) = fs.symlink_metadata(target) {
        if meta.is_dir() {
            fs.remove_dir_all(target)?;
        } else {
            fs.remove_file(target)?;
        }
    }
    fs.symlink(Path::new(&link), target)
}

fn apply_hardlink(
    fs: &dyn Fs,
    entry: &tar::Entry<'_, impl Read>,
    dest_root: &Path,
    target: &Path,
) -> Result<()> {
    let link = entry
        .link_name_bytes()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    let cleaned_src = match sanitize_entry_name(&link) {
        Ok(c) => c,
        Err(_) => return Err(anyhow!(LinkEscape(link))),
    };
    let source = dest_root.join(cleaned_src);
    if let Some(parent) = target.parent() {
        fs.mkdir_all(parent, DIR_MODE)?;
    }
    if fs.exists(target) {
        fs.remove_file(target)?;
    }
    fs.hard_link(&source, target)
}

/// Lexically resolve a symlink target and require it to stay inside
/// `dest_root`. Absolute link names are taken as-is; relative ones resolve
/// against the symlink's parent directory.
fn resolve_link(dest_root: &Path, cleaned: &str, link: &str) -> Option<PathBuf> {
    let mut stack: Vec<String> = Vec::new();
    if !link.starts_with('/') {
        let mut parent: Vec<&str> = cleaned.split('/').collect();
        parent.pop();
        stack.extend(parent.iter().map(|s| s.to_string()));
    }
    for comp in link.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            c => stack.push(c.to_string()),
        }
    }
    let resolved = if link.starts_with('/') {
        PathBuf::from("/").join(stack.join("/"))
    } else {
        dest_root.join(stack.join("/"))
    };
    if resolved.starts_with(dest_root) {
        Some(resolved)
    } else {
        None
    }
}

#[derive(Debug, thiserror::Error)]
#[error("link target escapes destination: {0}")]
struct LinkEscape(String);

fn is_traversal(e: &anyhow::Error) -> bool {
    e.downcast_ref::<LinkEscape>().is_some()
}

fn restore_attrs(
    fs: &dyn Fs,
    entry: &tar::Entry<'_, impl Read>,
    target: &Path,
    kind: tar::EntryType,
) {
    if kind == tar::EntryType::Symlink {
        return;
    }
    let header = entry.header();
    if let (Ok(uid), Ok(gid)) = (header.uid(), header.gid()) {
        let _ = fs.set_owner(target, uid as u32, gid as u32);
    }
    if let Ok(mtime) = header.mtime() {
        let _ = fs.set_times(target, mtime as i64);
    }
}

fn type_label(kind: tar::EntryType) -> &'static str {
    use tar::EntryType;
    match kind {
        EntryType::Directory => "dir",
        EntryType::Symlink => "symlink",
        EntryType::Link => "hardlink",
        _ => "file",
    }
}

fn effective_root() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::Uid::effective().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[derive(Default)]
struct Recorder {
    lines: Vec<String>,
    applied: usize,
    traversal: usize,
    illegal: usize,
    io_errors: usize,
}

impl Recorder {
    fn record(&mut self, status: &str, kind: &str, path: &str, size: u64) {
        match status {
            "applied" => self.applied += 1,
            "path_traversal" => self.traversal += 1,
            "illegal_path" => self.illegal += 1,
            _ => self.io_errors += 1,
        }
        self.lines.push(format!("{status}\t{kind}\t{path}\t{size}"));
    }

    fn flush(&self, fs: &dyn Fs, clock: &dyn Clock, log_dir: &Path) -> Result<PathBuf> {
        fs.mkdir_all(log_dir, 0o700)?;
        let path = log_dir.join(format!("extraction_{}.log", clock.epoch()));
        let mut body = self.lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs.write(&path, body.as_bytes(), LOG_MODE)?;
        Ok(path)
    }
}
