use std::process::ExitCode;

use callgen::compiler::{self, Args, Command};
use callgen::scenarios::all_scenarios;
use clap::Parser;
use colored::Colorize;
use itertools::Itertools;
use log::{debug, info};

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let level = if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    let l = Box::leak(Box::new(
        env_logger::Builder::new().format_timestamp(None).filter_level(level).build(),
    ));
    log::set_logger(l)?;
    log::set_max_level(level);
    debug!("{:#?}", args);

    let config = args.config()?;
    info!("callgen v0.1.0 targeting {}", config.target.name());

    match &args.command {
        Command::List => {
            for scenario in all_scenarios() {
                println!("{:20} {}", scenario.name.bold(), scenario.description);
            }
        }
        Command::Dump { scenario } => {
            let scenario = compiler::find_scenario(scenario)?;
            let module = compiler::compile_scenario(&scenario, &config)?;
            print!("{module}");
        }
        Command::Abi { scenario } => {
            let scenario = compiler::find_scenario(scenario)?;
            print!("{}", compiler::describe_scenario_abi(&scenario, &config)?);
        }
        Command::Run { scenario } => {
            let scenario = compiler::find_scenario(scenario)?;
            let result = compiler::run_scenario(&scenario, &config)?;
            println!("{}", result.iter().join(" "));
            if result != scenario.expected {
                eprintln!(
                    "{}: expected {:?}, got {:?}",
                    "mismatch".red(),
                    scenario.expected,
                    result
                );
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
