//! iodrill CLI entry point

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use iodrill::config::{self, cli::Cli};
use iodrill::job::Job;
use iodrill::output;
use iodrill::sysinfo::SysInfo;
use iodrill::util::clock::PerfClock;
use iodrill::Result;

fn main() -> ExitCode {
    let cmd_line = std::env::args().collect::<Vec<_>>().join(" ");
    let cli = Cli::parse_args(std::env::args());

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli, &cmd_line) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("iodrill: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, cmd_line: &str) -> Result<()> {
    // latency samples are in microseconds; the clock must resolve at least
    // that fine
    PerfClock::configure(1_000)?;

    let sys = SysInfo::probe(cli.cpu_affinity.as_deref())?;
    let (options, targets) = config::resolve(cli)?;

    let job = Job::new(options.clone(), targets, sys.clone());
    let results = job.run()?;

    output::print_report(cmd_line, &sys, &options, &results)
}
