use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod output;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let config = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(exit_codes::INPUT_ERROR);
        }
    };

    let exit_code = match cli.command {
        cli::Command::Normalize(args) => commands::normalize::execute(args),
        cli::Command::Replay(args) => commands::replay::execute(args, config).await,
        cli::Command::Stream(args) => commands::stream::execute(args, config).await,
    };

    std::process::exit(exit_code);
}
