mod commands;
mod helpers;

use clap::Parser;
use halo_core::domain::HaloError;

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let halo_error = error.as_halo_error();
            eprintln!("{}", halo_error.diagnostic_line());
            if let Some(summary_line) = halo_error.fatal_exit_line() {
                eprintln!("{summary_line}");
            }
            halo_error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("halo-analysis".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    match Cli::try_parse_from(&full_args) {
        Ok(cli) => {
            helpers::init_tracing(cli.verbose);
            dispatch_parsed(cli.command)
        }
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{err}");
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

#[derive(Parser)]
#[command(name = "halo-analysis", about = "Halo finding and halo catalog analysis")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Find halos in particle snapshots and write one catalog per snapshot
    Find(commands::FindArgs),
    /// Run an analysis pipeline over a halo catalog and save the result
    Create(commands::AnalysisArgs),
    /// Run an analysis pipeline and print the surviving halos
    Load(commands::AnalysisArgs),
    /// Summarize a saved halo catalog
    Inspect(commands::InspectArgs),
}

fn dispatch_parsed(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Find(args) => commands::run_find_command(args),
        CliCommand::Create(args) => commands::run_analysis_command(args, false),
        CliCommand::Load(args) => commands::run_analysis_command(args, true),
        CliCommand::Inspect(args) => commands::run_inspect_command(args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(#[from] HaloError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn as_halo_error(&self) -> HaloError {
        match self {
            Self::Usage(message) => HaloError::configuration("CONFIG.CLI_USAGE", message.clone()),
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => HaloError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}
