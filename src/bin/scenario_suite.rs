use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Result, bail};
use callgen::backend::vm::Vm;
use callgen::compiler::{self, LowerConfig, Target};
use callgen::scenarios::{Scenario, all_scenarios};
use clap::Parser;
use colored::Colorize;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct SuiteArgs {
    /// Run each scenario on its own thread
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub parallel: bool,

    /// Worker threads each lowering uses
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Filters scenarios by name substring
    pub filter: Option<String>,
}

/// Lowers and runs `scenario` for every target, checking the result and that nothing leaked
fn check_scenario(scenario: &Scenario, workers: usize) -> Result<()> {
    for target in Target::ALL {
        let config = LowerConfig { workers, ..LowerConfig::for_target(target) };
        let module = compiler::compile_scenario(scenario, &config)?;
        let mut vm = Vm::make(&module);
        let result = match vm.call_symbol(scenario.entry, &scenario.args) {
            Ok(r) => r,
            Err(e) => bail!("{}: {}", target.name(), e),
        };
        if result.as_slice() != scenario.expected.as_slice() {
            bail!("{}: expected {:?}, got {:?}", target.name(), scenario.expected, result);
        }
        if vm.live_objects() != 0 {
            bail!("{}: {} heap objects leaked", target.name(), vm.live_objects());
        }
    }
    Ok(())
}

pub fn main() -> Result<()> {
    let suite_args = SuiteArgs::parse();
    eprintln!("{:#?}", suite_args);
    let scenarios: Vec<Scenario> = all_scenarios()
        .into_iter()
        .filter(|s| suite_args.filter.as_ref().is_none_or(|f| s.name.contains(f.as_str())))
        .collect();

    let total = scenarios.len();
    let success = AtomicUsize::new(0);
    let failures = Mutex::new(Vec::with_capacity(total));
    let workers = suite_args.workers.max(1);

    let check = |scenario: &Scenario| {
        eprintln!("{:030}...", scenario.name);
        match check_scenario(scenario, workers) {
            Ok(()) => {
                eprintln!("{:030} {}", scenario.name, "PASS".green());
                success.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let mut failures = failures.lock().unwrap_or_else(PoisonError::into_inner);
                failures.push((scenario.name, e));
            }
        }
    };

    if suite_args.parallel {
        std::thread::scope(|scope| {
            for scenario in scenarios.iter() {
                scope.spawn(|| check(scenario));
            }
        });
    } else {
        scenarios.iter().for_each(check);
    }

    let success = success.into_inner();
    if success != total {
        let failures = failures.lock().unwrap_or_else(PoisonError::into_inner);
        eprintln!("\n-----------------------------------\nFailed scenarios:\n");
        for (name, error) in failures.iter() {
            eprintln!("{name:030} {}: {}", "FAIL".red(), error);
        }
        bail!("{} scenarios failed", total - success);
    }
    eprintln!("Ran {} scenarios, {} succeeded", total, success);
    Ok(())
}
