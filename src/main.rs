use std::process::ExitCode;

use anyhow::{Context, Result};

use pymask::logging::{init_logging, LogConfig};
use pymask::{Config, Environment};

fn main() -> ExitCode {
    let config = Config::new();

    let log_config = LogConfig {
        debug: config.debug,
        verbosity: config.verbose,
    };
    if let Err(err) = init_logging(&log_config) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    if let Err(err) = run(&config) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(config: &Config) -> Result<()> {
    let env = Environment::from_process();
    let written = pymask::run(config, &env)
        .with_context(|| format!("Failed to generate mask for {}", config.image_file.display()))?;

    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}
