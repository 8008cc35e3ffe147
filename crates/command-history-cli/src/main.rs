use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    command_history_cli::init_tracing();
    let cli = command_history_cli::Cli::parse();
    command_history_cli::run_cli(cli)
}
