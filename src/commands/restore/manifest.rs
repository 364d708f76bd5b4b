use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::commands::restore::categories::SystemType;
use crate::utils::fs::Fs;
use crate::utils::time::parse_rfc3339_to_unix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    None,
    Age,
    Passphrase,
}

/// Sidecar metadata describing one archive; read-only once loaded.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub archive_path: PathBuf,
    pub proxmox_type: SystemType,
    pub proxmox_version: String,
    pub hostname: String,
    /// Unix seconds, UTC.
    pub created_at: u64,
    pub encryption_mode: EncryptionMode,
    pub script_version: String,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    archive_path: String,
    proxmox_type: String,
    #[serde(default)]
    proxmox_version: String,
    #[serde(default)]
    hostname: String,
    created_at: String,
    encryption_mode: EncryptionMode,
    #[serde(default)]
    script_version: String,
}

impl Manifest {
    fn from_raw(raw: RawManifest) -> Result<Self> {
        Ok(Self {
            archive_path: PathBuf::from(raw.archive_path),
            proxmox_type: SystemType::parse(&raw.proxmox_type),
            proxmox_version: raw.proxmox_version,
            hostname: raw.hostname,
            created_at: parse_rfc3339_to_unix(&raw.created_at)
                .context("manifest created_at")?,
            encryption_mode: raw.encryption_mode,
            script_version: raw.script_version,
        })
    }

    pub fn load(fs: &dyn Fs, path: &Path) -> Result<Self> {
        let data = fs
            .read(path)
            .with_context(|| format!("load manifest {}", path.display()))?;
        let raw: RawManifest = serde_json::from_slice(&data)
            .with_context(|| format!("parse manifest {}", path.display()))?;
        Self::from_raw(raw)
    }

    /// Read the manifest out of a bundle: a plain tar whose first useful
    /// entry is `backup/<archiveBase>.metadata`.
    pub fn from_bundle(bundle: &Path) -> Result<Self> {
        let file =
            File::open(bundle).with_context(|| format!("open bundle {}", bundle.display()))?;
        let mut archive = tar::Archive::new(file);
        for entry in archive
            .entries()
            .with_context(|| format!("read bundle {}", bundle.display()))?
        {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let clean = name.trim_start_matches("./");
            if !(clean.starts_with("backup/") && clean.ends_with(".metadata")) {
                continue;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            let raw: RawManifest = serde_json::from_slice(&data)
                .with_context(|| format!("parse bundle manifest {clean}"))?;
            return Self::from_raw(raw);
        }
        bail!("no metadata entry found in bundle {}", bundle.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fs::RealFs;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "archive_path": "/backup/proxsave_pve1.tar.gz",
        "proxmox_type": "pve",
        "proxmox_version": "8.2",
        "hostname": "pve1",
        "created_at": "2024-05-01T10:30:00Z",
        "encryption_mode": "age",
        "script_version": "1.4.0"
    }"#;

    #[test]
    fn load_parses_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let m = Manifest::load(&RealFs::new(), &path).unwrap();
        assert_eq!(m.proxmox_type, SystemType::Pve);
        assert_eq!(m.hostname, "pve1");
        assert_eq!(m.encryption_mode, EncryptionMode::Age);
        assert_eq!(m.created_at, 1_714_559_400);
    }

    #[test]
    fn unknown_type_tolerated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.json");
        std::fs::write(
            &path,
            SAMPLE.replace("\"pve\"", "\"other\"").replace("\"age\"", "\"none\""),
        )
        .unwrap();
        let m = Manifest::load(&RealFs::new(), &path).unwrap();
        assert_eq!(m.proxmox_type, SystemType::Unknown);
        assert_eq!(m.encryption_mode, EncryptionMode::None);
    }

    #[test]
    fn bundle_metadata_found() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle.tar");
        let f = File::create(&bundle).unwrap();
        let mut b = tar::Builder::new(f);

        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        b.append_data(&mut header, "backup/readme.txt", &b"hello"[..])
            .unwrap();

        let meta = SAMPLE.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(meta.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        b.append_data(&mut header, "backup/proxsave_pve1.metadata", meta)
            .unwrap();
        b.finish().unwrap();

        let m = Manifest::from_bundle(&bundle).unwrap();
        assert_eq!(m.hostname, "pve1");
    }

    #[test]
    fn bundle_without_metadata_fails() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle.tar");
        let f = File::create(&bundle).unwrap();
        let mut b = tar::Builder::new(f);
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        b.append_data(&mut header, "backup/data.bin", &b""[..]).unwrap();
        b.finish().unwrap();

        let err = Manifest::from_bundle(&bundle).unwrap_err().to_string();
        assert!(err.contains("no metadata entry"));
    }
}
