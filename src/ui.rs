use std::io::BufRead;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, select, tick, unbounded};
use prettytable::{Cell, Row, Table};

use crate::commands::restore::categories::{Category, SystemType};
use crate::commands::restore::health::HealthReport;
use crate::commands::restore::plan::{RestoreMode, RestorePlan};
use crate::errors::Aborted;
use crate::utils::cancel::Ctx;

/// Outcome of the NIC-name repair pass offered before a network apply.
#[derive(Debug, Clone, Default)]
pub struct NicRepairSummary {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    Committed,
    Declined,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub title: String,
    pub message: String,
    pub yes_label: String,
    pub no_label: String,
    pub timeout: Option<Duration>,
    pub default_yes: bool,
}

pub struct CommitRequest<'a> {
    pub remaining: Duration,
    pub health: &'a HealthReport,
    pub nic_repair: &'a NicRepairSummary,
    pub diagnostics_dir: &'a Path,
}

pub trait Progress: Send + Sync {
    fn update(&self, message: &str);
}

/// Everything the restore core asks of a human. The console backend below
/// implements it for the CLI; tests script it.
pub trait RestoreUi: Send + Sync {
    fn run_task(
        &self,
        ctx: &Ctx,
        title: &str,
        initial: &str,
        f: &dyn Fn(&Ctx, &dyn Progress) -> Result<()>,
    ) -> Result<()>;

    fn show_message(&self, text: &str);
    fn show_error(&self, text: &str);

    fn select_backup_source(&self, options: &[String]) -> Result<usize>;
    fn select_backup_candidate(&self, candidates: &[String]) -> Result<usize>;
    fn prompt_decrypt_secret(&self, display_name: &str, previous_error: Option<&str>)
    -> Result<String>;

    fn select_restore_mode(&self, system_type: SystemType) -> Result<RestoreMode>;
    fn select_categories(&self, available: &[Category], system_type: SystemType)
    -> Result<Vec<String>>;
    fn show_restore_plan(&self, plan: &RestorePlan);
    fn confirm_restore(&self) -> Result<bool>;
    fn confirm_compatibility(&self, err: &str) -> Result<bool>;

    fn select_cluster_safe_mode(&self) -> Result<bool>;
    fn confirm_continue_without_safety_backup(&self, cause: &str) -> Result<bool>;
    fn confirm_continue_with_pbs_services_running(&self) -> Result<bool>;
    fn confirm_fstab_merge(&self, details: &str) -> Result<bool>;

    fn confirm_action(&self, req: &ConfirmRequest) -> Result<bool>;
    fn repair_nic_names(&self, archive_path: &Path) -> Result<NicRepairSummary>;

    /// Blocks until the user commits, declines, or the window closes.
    /// `remaining <= 0` times out immediately without reading input.
    fn prompt_network_commit(&self, ctx: &Ctx, req: &CommitRequest<'_>) -> CommitDecision;
}

/// Line-oriented console backend. A reader thread owns stdin; prompts race
/// its channel against tickers and deadlines so timeouts hold within a
/// second even while a read is pending.
pub struct ConsoleUi {
    lines: Mutex<Receiver<String>>,
}

impl Default for ConsoleUi {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleUi {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<String>();
        thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            lines: Mutex::new(rx),
        }
    }

    fn read_line(&self, ctx: &Ctx, timeout: Option<Duration>) -> Option<String> {
        let guard = self.lines.lock().unwrap();
        let rx = &*guard;
        // the prompt's own timeout and the context deadline both end it
        let cap = match (timeout, ctx.remaining()) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (Some(t), None) => Some(t),
            (None, r) => r,
        };
        let deadline = cap.map(|t| Instant::now() + t);
        let ticker = tick(Duration::from_millis(250));
        loop {
            select! {
                recv(rx) -> line => return line.ok(),
                recv(ticker) -> _ => {
                    if ctx.cancelled() {
                        return None;
                    }
                    if let Some(d) = deadline
                        && Instant::now() >= d
                    {
                        return None;
                    }
                }
            }
        }
    }

    fn pick(&self, what: &str, options: &[String]) -> Result<usize> {
        if options.is_empty() {
            return Err(anyhow!("no {what} available"));
        }
        println!("Select {what}:");
        for (i, o) in options.iter().enumerate() {
            println!("  [{}] {o}", i + 1);
        }
        print_prompt(&format!("{what} [1-{}]: ", options.len()));
        let line = self
            .read_line(&Ctx::background(), None)
            .ok_or_else(|| anyhow!(Aborted(format!("{what} selection aborted"))))?;
        let n: usize = line.trim().parse().map_err(|_| anyhow!("invalid selection"))?;
        if n == 0 || n > options.len() {
            return Err(anyhow!("selection out of range"));
        }
        Ok(n - 1)
    }
}

fn print_prompt(s: &str) {
    use std::io::Write;
    print!("{s}");
    let _ = std::io::stdout().flush();
}

fn yes_no(answer: Option<String>, default_yes: bool) -> bool {
    match answer {
        Some(line) => {
            let t = line.trim().to_ascii_lowercase();
            if t.is_empty() {
                default_yes
            } else {
                t == "y" || t == "yes"
            }
        }
        None => false,
    }
}

impl RestoreUi for ConsoleUi {
    fn run_task(
        &self,
        ctx: &Ctx,
        title: &str,
        initial: &str,
        f: &dyn Fn(&Ctx, &dyn Progress) -> Result<()>,
    ) -> Result<()> {
        struct ConsoleProgress;
        impl Progress for ConsoleProgress {
            fn update(&self, message: &str) {
                tracing::info!("{message}");
            }
        }
        tracing::info!("{title}: {initial}");
        f(ctx, &ConsoleProgress)
    }

    fn show_message(&self, text: &str) {
        println!("{text}");
    }

    fn show_error(&self, text: &str) {
        eprintln!("error: {text}");
    }

    fn select_backup_source(&self, options: &[String]) -> Result<usize> {
        self.pick("backup source", options)
    }

    fn select_backup_candidate(&self, candidates: &[String]) -> Result<usize> {
        self.pick("backup archive", candidates)
    }

    fn prompt_decrypt_secret(
        &self,
        display_name: &str,
        previous_error: Option<&str>,
    ) -> Result<String> {
        if let Some(err) = previous_error {
            eprintln!("decryption failed: {err}");
        }
        print_prompt(&format!("secret for {display_name}: "));
        self.read_line(&Ctx::background(), None)
            .ok_or_else(|| anyhow!(Aborted("secret prompt aborted".into())))
    }

    fn select_restore_mode(&self, system_type: SystemType) -> Result<RestoreMode> {
        let options = vec![
            "full".to_string(),
            "storage".to_string(),
            "base".to_string(),
            "custom".to_string(),
        ];
        println!("System type: {}", system_type.as_str());
        Ok(match self.pick("restore mode", &options)? {
            0 => RestoreMode::Full,
            1 => RestoreMode::Storage,
            2 => RestoreMode::Base,
            _ => RestoreMode::Custom,
        })
    }

    fn select_categories(
        &self,
        available: &[Category],
        _system_type: SystemType,
    ) -> Result<Vec<String>> {
        println!("Available categories (comma-separated ids, empty for all):");
        let mut table = Table::new();
        table.set_titles(Row::new(vec![
            Cell::new("ID"),
            Cell::new("Name"),
            Cell::new("Description"),
        ]));
        for c in available {
            table.add_row(Row::new(vec![
                Cell::new(&c.id),
                Cell::new(&c.name),
                Cell::new(&c.description),
            ]));
        }
        table.printstd();
        print_prompt("categories: ");
        let line = self
            .read_line(&Ctx::background(), None)
            .ok_or_else(|| anyhow!(Aborted("category selection aborted".into())))?;
        let picked: Vec<String> = line
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if picked.is_empty() {
            return Ok(available.iter().map(|c| c.id.clone()).collect());
        }
        Ok(picked)
    }

    fn show_restore_plan(&self, plan: &RestorePlan) {
        println!(
            "Restore plan (mode={}, system={}, cluster-safe={})",
            plan.mode.as_str(),
            plan.system_type.as_str(),
            plan.cluster_safe_mode()
        );
        let mut table = Table::new();
        table.set_titles(Row::new(vec![
            Cell::new("Bucket"),
            Cell::new("Category"),
            Cell::new("Paths"),
        ]));
        for (bucket, cats) in [
            ("normal", &plan.normal),
            ("staged", &plan.staged),
            ("export", &plan.export),
        ] {
            for c in cats {
                table.add_row(Row::new(vec![
                    Cell::new(bucket),
                    Cell::new(&c.id),
                    Cell::new(&c.paths.join("\n")),
                ]));
            }
        }
        table.printstd();
    }

    fn confirm_restore(&self) -> Result<bool> {
        self.confirm_action(&ConfirmRequest {
            title: "Restore".into(),
            message: "Proceed with the restore?".into(),
            yes_label: "yes".into(),
            no_label: "no".into(),
            timeout: None,
            default_yes: false,
        })
    }

    fn confirm_compatibility(&self, err: &str) -> Result<bool> {
        self.confirm_action(&ConfirmRequest {
            title: "Compatibility".into(),
            message: format!("Archive looks incompatible ({err}). Continue anyway?"),
            yes_label: "continue".into(),
            no_label: "abort".into(),
            timeout: None,
            default_yes: false,
        })
    }

    fn select_cluster_safe_mode(&self) -> Result<bool> {
        self.confirm_action(&ConfirmRequest {
            title: "Cluster restore".into(),
            message: "Export cluster files instead of restoring them live (cluster-safe mode)?"
                .into(),
            yes_label: "export".into(),
            no_label: "restore live".into(),
            timeout: None,
            default_yes: true,
        })
    }

    fn confirm_continue_without_safety_backup(&self, cause: &str) -> Result<bool> {
        self.confirm_action(&ConfirmRequest {
            title: "Safety backup".into(),
            message: format!("Safety backup unavailable ({cause}). Continue without it?"),
            yes_label: "continue".into(),
            no_label: "abort".into(),
            timeout: None,
            default_yes: false,
        })
    }

    fn confirm_continue_with_pbs_services_running(&self) -> Result<bool> {
        self.confirm_action(&ConfirmRequest {
            title: "PBS services".into(),
            message: "PBS services are running. Restoring now may race them. Continue?".into(),
            yes_label: "continue".into(),
            no_label: "abort".into(),
            timeout: None,
            default_yes: false,
        })
    }

    fn confirm_fstab_merge(&self, details: &str) -> Result<bool> {
        self.confirm_action(&ConfirmRequest {
            title: "fstab".into(),
            message: format!("Merge restored fstab entries?\n{details}"),
            yes_label: "merge".into(),
            no_label: "skip".into(),
            timeout: None,
            default_yes: false,
        })
    }

    fn confirm_action(&self, req: &ConfirmRequest) -> Result<bool> {
        println!("{}", req.title);
        println!("{}", req.message);
        let def = if req.default_yes { "Y/n" } else { "y/N" };
        print_prompt(&format!("{} / {} [{def}]: ", req.yes_label, req.no_label));
        let answer = self.read_line(&Ctx::background(), req.timeout);
        if answer.is_none() && req.timeout.is_some() {
            println!();
            println!("timed out, taking '{}'", req.no_label);
            return Ok(false);
        }
        Ok(yes_no(answer, req.default_yes))
    }

    fn repair_nic_names(&self, archive_path: &Path) -> Result<NicRepairSummary> {
        // interactive NIC remapping lives in the TUI; the console backend
        // reports a no-op summary
        tracing::debug!("nic repair skipped for {}", archive_path.display());
        Ok(NicRepairSummary::default())
    }

    fn prompt_network_commit(&self, ctx: &Ctx, req: &CommitRequest<'_>) -> CommitDecision {
        if req.remaining.is_zero() {
            return CommitDecision::TimedOut;
        }

        println!("{}", req.health.render());
        if !req.nic_repair.applied.is_empty() || !req.nic_repair.conflicts.is_empty() {
            println!(
                "NIC repair: {} applied, {} skipped, {} conflict(s)",
                req.nic_repair.applied.len(),
                req.nic_repair.skipped.len(),
                req.nic_repair.conflicts.len()
            );
        }
        println!("Diagnostics: {}", req.diagnostics_dir.display());
        println!(
            "Type COMMIT within {}s to keep the new network configuration;",
            req.remaining.as_secs()
        );
        println!("anything else (or silence) rolls it back.");

        let deadline = Instant::now() + req.remaining;
        let guard = self.lines.lock().unwrap();
        let rx = &*guard;
        let ticker = tick(Duration::from_secs(1));
        loop {
            select! {
                recv(rx) -> line => {
                    return match line {
                        Ok(l) if l.trim().eq_ignore_ascii_case("commit") => {
                            CommitDecision::Committed
                        }
                        Ok(_) => CommitDecision::Declined,
                        Err(_) => CommitDecision::TimedOut,
                    };
                }
                recv(ticker) -> _ => {
                    if ctx.cancelled() {
                        return CommitDecision::TimedOut;
                    }
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        println!();
                        return CommitDecision::TimedOut;
                    }
                    print_prompt(&format!("\rcommit window: {:>4}s ", left.as_secs()));
                }
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted [`RestoreUi`]: canned answers, recorded prompts.
    #[derive(Default)]
    pub struct ScriptedUi {
        pub commit_decision: Mutex<Option<CommitDecision>>,
        pub confirm_answers: Mutex<Vec<bool>>,
        pub nic_summary: Mutex<NicRepairSummary>,
        pub commit_prompts: Mutex<Vec<u64>>, // remaining seconds seen
        pub messages: Mutex<Vec<String>>,
        pub errors: Mutex<Vec<String>>,
    }

    impl ScriptedUi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn decide_commit(&self, d: CommitDecision) {
            *self.commit_decision.lock().unwrap() = Some(d);
        }
    }

    impl RestoreUi for ScriptedUi {
        fn run_task(
            &self,
            ctx: &Ctx,
            _title: &str,
            _initial: &str,
            f: &dyn Fn(&Ctx, &dyn Progress) -> Result<()>,
        ) -> Result<()> {
            struct Quiet;
            impl Progress for Quiet {
                fn update(&self, _m: &str) {}
            }
            f(ctx, &Quiet)
        }

        fn show_message(&self, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }

        fn show_error(&self, text: &str) {
            self.errors.lock().unwrap().push(text.to_string());
        }

        fn select_backup_source(&self, _options: &[String]) -> Result<usize> {
            Ok(0)
        }

        fn select_backup_candidate(&self, _candidates: &[String]) -> Result<usize> {
            Ok(0)
        }

        fn prompt_decrypt_secret(
            &self,
            _display_name: &str,
            _previous_error: Option<&str>,
        ) -> Result<String> {
            Ok("secret".into())
        }

        fn select_restore_mode(&self, _system_type: SystemType) -> Result<RestoreMode> {
            Ok(RestoreMode::Full)
        }

        fn select_categories(
            &self,
            available: &[Category],
            _system_type: SystemType,
        ) -> Result<Vec<String>> {
            Ok(available.iter().map(|c| c.id.clone()).collect())
        }

        fn show_restore_plan(&self, _plan: &RestorePlan) {}

        fn confirm_restore(&self) -> Result<bool> {
            Ok(self.next_confirm())
        }

        fn confirm_compatibility(&self, _err: &str) -> Result<bool> {
            Ok(self.next_confirm())
        }

        fn select_cluster_safe_mode(&self) -> Result<bool> {
            Ok(self.next_confirm())
        }

        fn confirm_continue_without_safety_backup(&self, _cause: &str) -> Result<bool> {
            Ok(self.next_confirm())
        }

        fn confirm_continue_with_pbs_services_running(&self) -> Result<bool> {
            Ok(self.next_confirm())
        }

        fn confirm_fstab_merge(&self, _details: &str) -> Result<bool> {
            Ok(self.next_confirm())
        }

        fn confirm_action(&self, _req: &ConfirmRequest) -> Result<bool> {
            Ok(self.next_confirm())
        }

        fn repair_nic_names(&self, _archive_path: &Path) -> Result<NicRepairSummary> {
            Ok(self.nic_summary.lock().unwrap().clone())
        }

        fn prompt_network_commit(&self, _ctx: &Ctx, req: &CommitRequest<'_>) -> CommitDecision {
            self.commit_prompts
                .lock()
                .unwrap()
                .push(req.remaining.as_secs());
            if req.remaining.is_zero() {
                return CommitDecision::TimedOut;
            }
            self.commit_decision
                .lock()
                .unwrap()
                .unwrap_or(CommitDecision::TimedOut)
        }
    }

    impl ScriptedUi {
        fn next_confirm(&self) -> bool {
            let mut answers = self.confirm_answers.lock().unwrap();
            if answers.is_empty() { true } else { answers.remove(0) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_remaining_times_out_without_reading_input() {
        let ui = ConsoleUi::new();
        let health = HealthReport {
            checks: Vec::new(),
            generated_at: 0,
        };
        let nic = NicRepairSummary::default();
        let req = CommitRequest {
            remaining: Duration::ZERO,
            health: &health,
            nic_repair: &nic,
            diagnostics_dir: Path::new("/tmp"),
        };
        assert_eq!(
            ui.prompt_network_commit(&Ctx::background(), &req),
            CommitDecision::TimedOut
        );
    }

    #[test]
    fn yes_no_honors_default() {
        assert!(yes_no(Some("".into()), true));
        assert!(!yes_no(Some("".into()), false));
        assert!(yes_no(Some("YES".into()), false));
        assert!(!yes_no(Some("nope".into()), true));
        assert!(!yes_no(None, true));
    }
}
