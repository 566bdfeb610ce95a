use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use xtask::{run_and_report, test_all, Scenario};

/// Developer utility tasks.
#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the workspace tests, then every built-in scenario.
    Test {
        /// Log level for the runtime (POSIXRT_LOG).
        #[arg(long, default_value = "warn")]
        log: String,
    },
    /// Run one end-to-end scenario in-process.
    Scenario {
        #[arg(value_enum)]
        name: Scenario,
    },
}

fn main() -> Result<()> {
    match Cli::parse().cmd {
        Cmd::Test { log } => test_all(&log),
        Cmd::Scenario { name } => {
            if !run_and_report(name) {
                bail!("scenario {:?} failed", name);
            }
            Ok(())
        }
    }
}
