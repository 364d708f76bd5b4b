use std::path::PathBuf;

use thiserror::Error;

/// Subprocess exited non-zero. Keeps the merged stdout+stderr bytes so
/// callers can inspect the tool's own wording (e.g. not-found detection).
#[derive(Debug, Error)]
#[error("command failed: {rendered} (status {status})")]
pub struct CmdFailed {
    pub rendered: String,
    pub status: i32,
    pub output: Vec<u8>,
}

impl CmdFailed {
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// User cancelled a prompt or the surrounding context was cancelled.
#[derive(Debug, Error)]
#[error("aborted: {0}")]
pub struct Aborted(pub String);

#[derive(Debug, Error)]
#[error("archive malformed: {0}")]
pub struct ArchiveMalformed(pub String);

/// Network preflight validator rejected the configuration.
#[derive(Debug)]
pub struct PreflightFailed {
    pub tool: String,
    pub detail: String,
    /// Set when staged files were already written and rolled back.
    pub rollback_log: Option<PathBuf>,
}

impl std::error::Error for PreflightFailed {}

impl std::fmt::Display for PreflightFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "preflight failed ({}): {}", self.tool, self.detail)?;
        if let Some(log) = &self.rollback_log {
            write!(f, "; rollback log: {}", log.display())?;
        }
        Ok(())
    }
}

/// The rollback timer is armed (or already running) and the user did not
/// confirm the network change. The timer stays armed on purpose.
#[derive(Debug)]
pub struct NotCommitted {
    pub rollback_log: PathBuf,
    pub marker: PathBuf,
    pub restored_ip: Option<String>,
    pub original_ip: Option<String>,
    /// Unix seconds at which the scheduled rollback fires.
    pub rollback_deadline: u64,
    /// Disarm raced a timer that had already started the script.
    pub timer_race: bool,
}

impl std::error::Error for NotCommitted {}

impl std::fmt::Display for NotCommitted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.timer_race {
            write!(f, "commit arrived too late, rollback already running")?;
        } else {
            write!(f, "network change not committed, rollback stays armed")?;
        }
        write!(
            f,
            " (deadline {}, log {}, marker {})",
            self.rollback_deadline,
            self.rollback_log.display(),
            self.marker.display()
        )?;
        match (&self.restored_ip, &self.original_ip) {
            (Some(now), Some(orig)) => write!(f, "; current ip {now}, previous ip {orig}"),
            (Some(now), None) => write!(f, "; current ip {now}"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_failed_keeps_bytes() {
        let e = CmdFailed {
            rendered: "pvesh set /x".into(),
            status: 2,
            output: b"no such resource 'x'".to_vec(),
        };
        assert!(e.to_string().contains("status 2"));
        assert!(e.output_text().contains("no such resource"));
    }

    #[test]
    fn not_committed_mentions_race() {
        let e = NotCommitted {
            rollback_log: PathBuf::from("/tmp/r.log"),
            marker: PathBuf::from("/tmp/m"),
            restored_ip: Some("10.0.0.5".into()),
            original_ip: Some("10.0.0.4".into()),
            rollback_deadline: 1700000000,
            timer_race: true,
        };
        let msg = e.to_string();
        assert!(msg.contains("too late"));
        assert!(msg.contains("10.0.0.4"));
    }
}
