mod cli;

use clap::Parser;
use tracing::error;

fn main() {
    let args = cli::Cli::parse();

    if let Err(err) = cli::run(args) {
        error!("CLI error: {}", err);
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
