use clap::Parser;
use sio2em::daemon::{Cli, Config, Lockfile};

fn main() {
    let cli = Cli::parse();
    let level = if cli.extended_logging { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).init();

    let _lock = match Lockfile::acquire() {
        Ok(lock) => lock,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let config = Config::from(cli);
    if let Err(e) = sio2em::run(config) {
        log::error!("fatal: {e}");
        std::process::exit(2);
    }
}
