pub mod categories;
pub mod executor;
pub mod extract;
pub mod health;
pub mod manifest;
pub mod network;
pub mod plan;
pub mod scan;
pub mod stage;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};

use crate::AppCtx;
use crate::commands::restore::plan::RestoreMode;
use crate::ui::{ConsoleUi, RestoreUi};
use crate::utils::cancel::Ctx;

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[command(subcommand)]
    cmd: RestoreCmd,
}

#[derive(Subcommand, Debug, Clone)]
enum RestoreCmd {
    /// Restore an archive onto this host
    Run(RunArgs),
    /// Show what a restore would do without touching the system
    Plan(RunArgs),
    /// Reconcile the temp-dir registry (remove dead-process leftovers)
    Sweep,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Archive (tar or tar.gz) to restore from
    pub archive: PathBuf,

    /// Sidecar manifest; defaults to <archive>.manifest.json, then the
    /// bundle metadata entry
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    #[arg(long, default_value = "custom")]
    pub mode: String,

    /// Category id to restore (repeatable); empty asks interactively
    #[arg(long = "category")]
    pub categories: Vec<String>,

    /// Skip the final confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

impl RunArgs {
    fn to_opts(&self) -> Result<executor::RunOpts> {
        let mode = match self.mode.trim() {
            "full" => RestoreMode::Full,
            "storage" => RestoreMode::Storage,
            "base" => RestoreMode::Base,
            "custom" => RestoreMode::Custom,
            other => bail!("invalid --mode '{other}', expected full|storage|base|custom"),
        };
        Ok(executor::RunOpts {
            archive: self.archive.clone(),
            manifest: self.manifest.clone(),
            mode,
            categories: self.categories.clone(),
            assume_yes: self.yes,
        })
    }
}

impl RestoreArgs {
    pub fn run(&self, app: &AppCtx) -> Result<()> {
        let ui = ConsoleUi::new();
        let ctx = Ctx::background();
        match &self.cmd {
            RestoreCmd::Run(args) => {
                executor::restore_run(&ctx, app, &ui as &dyn RestoreUi, args.to_opts()?)
            }
            RestoreCmd::Plan(args) => executor::restore_plan(app, &ui, args.to_opts()?),
            RestoreCmd::Sweep => executor::registry_sweep(app),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        let args = RunArgs {
            archive: PathBuf::from("/b.tar.gz"),
            manifest: None,
            mode: "base".into(),
            categories: vec![],
            yes: false,
        };
        assert_eq!(args.to_opts().unwrap().mode, RestoreMode::Base);

        let bad = RunArgs {
            mode: "everything".into(),
            ..args
        };
        assert!(bad.to_opts().unwrap_err().to_string().contains("invalid --mode"));
    }
}
