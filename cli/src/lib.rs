use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use clap::Subcommand;

mod run_cmd;

pub use run_cmd::RunCli;

#[derive(Debug, Parser)]
#[command(
    name = "kernelhub",
    version,
    about = "Run code against datasets in supervised worker sessions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a session, run code once and print the execution as an event stream.
    Run(RunCli),
}

pub async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run(run) => run_cmd::run(run).await,
    }
}
