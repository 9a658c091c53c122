mod app;
mod plan;
mod run;

use clap::Parser;

use crate::app::Cli;

fn main() {
    let cli = Cli::parse();

    // Library diagnostics on stderr; status lines stay on stdout.
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("cilpatch", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if let Err(error) = run::run(&cli) {
        println!("[ERR] {error:#}");
        std::process::exit(1);
    }
}
