use clap::Parser;
use std::process::ExitCode;

use shipwright_installer::cli::{self, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();
    ExitCode::from(cli::run(cli))
}
