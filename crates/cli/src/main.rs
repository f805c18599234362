// tether CLI entry point.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "tether", about = "Anchor relocation and conflict-safe AI edits")]
struct Cli {
    /// Gateway config file (defaults to ~/.tether/gateway.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.json);
    let ctx = commands::Context { format, config_path: cli.config };

    match commands::run(cli.command, &ctx) {
        Ok(code) => code.into(),
        Err(err) => {
            output::print_anyhow_error(format, &err);
            ExitCode::from_error(&err).into()
        }
    }
}
