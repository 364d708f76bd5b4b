use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;
mod config;
mod errors;
mod tooling;
mod ui;
mod utils;

use commands::restore;
use config::Config;
use tooling::Toolbox;
use utils::clock::SystemClock;
use utils::fs::RealFs;
use utils::process::{ProcessRunner, Runner};

pub struct AppCtx {
    pub debug: bool,
    pub cfg: Config,
    pub runner: Arc<dyn Runner + Send + Sync>,
    pub fs: Arc<RealFs>,
    pub clock: Arc<SystemClock>,
    pub tools: Toolbox,
}

#[derive(Parser, Debug)]
#[command(
    name = "proxsave",
    about = "Restore orchestrator for Proxmox VE and Backup Server hosts",
    arg_required_else_help = false,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = "/etc/proxsave/config.toml", global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    Restore(restore::RestoreArgs),
}

fn init_tracing(debug: bool) {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .without_time()
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.command.is_none() && !cli.check_config && !cli.print_config {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    }
    let cfg = Config::load(&cli.config)?;

    if cli.check_config {
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_toml()?);
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    let runner: Arc<dyn Runner + Send + Sync> = Arc::new(ProcessRunner::new());
    let ctx = AppCtx {
        debug: cli.debug,
        cfg,
        fs: Arc::new(RealFs::new()),
        clock: Arc::new(SystemClock::new()),
        tools: Toolbox::new(runner.clone()),
        runner,
    };

    match cmd {
        Cmd::Restore(args) => args.run(&ctx),
    }
}
