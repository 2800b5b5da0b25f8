use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask", about = "Development tasks for the vento workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Build every workspace member
    Build,
    /// Run the test suite
    Test,
    /// Run clippy over the workspace
    Lint,
    /// Run the vento CLI, forwarding extra arguments
    Run {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Task::Build => cargo(&["build", "--workspace"]),
        Task::Test => cargo(&["test", "--workspace"]),
        Task::Lint => cargo(&["clippy", "--workspace", "--all-targets"]),
        Task::Run { args } => {
            let mut full = vec!["run", "-p", "vento-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo(&full)
        }
    }
}
