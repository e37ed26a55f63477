use std::io;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use log::error;
use rank_sum::{install_fault_hook, run, Config, RuntimeError, World};

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    install_fault_hook();

    let config = Config::parse();

    match launch(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RuntimeError::Aborted(code)) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn launch(config: &Config) -> rank_sum::Result<()> {
    let world = World::init(config.ranks)?;

    let stdout = io::stdout();
    run(&world, config, &mut stdout.lock())?;

    world.finalize()
}
