// Copyright (c) 2025 knix
// All rights reserved.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use log::info;

use crate::abi::{AbiClassifier, ArgPlan, ResultPlan};
use crate::backend::ir::IrModule;
use crate::backend::vm::Vm;
use crate::errors::write_error;
use crate::lower::{LowerCaches, lower_program};
use crate::scenarios::{self, Scenario};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    MacOs,
    Wasm,
}

pub fn detect_host_target() -> Option<Target> {
    let (arch, word_size) = match std::env::consts::ARCH {
        "x86" => (Arch::Intel, WordSize::W32),
        "x86_64" => (Arch::Intel, WordSize::W64),
        "arm" => (Arch::Arm, WordSize::W32),
        "aarch64" => (Arch::Arm, WordSize::W64),
        "wasm32" => (Arch::Wasm, WordSize::W32),
        _ => return None,
    };
    let os = match std::env::consts::OS {
        "linux" => Some(TargetOs::Linux),
        "macos" => Some(TargetOs::MacOs),
        _ if arch == Arch::Wasm => Some(TargetOs::Wasm),
        _ => None,
    };
    Target::from(arch, word_size, os)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordSize {
    W32,
    W64,
}

impl WordSize {
    pub const fn bits(&self) -> u32 {
        match self {
            WordSize::W32 => 32,
            WordSize::W64 => 64,
        }
    }

    pub const fn bytes(&self) -> u32 {
        self.bits() / 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Intel,
    Arm,
    Wasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
/// For now, I just do a simple exhaustive enum of the triples I actually support
/// rather than a 'target triple' type of struct where very few values of that type
/// are actually valid
pub enum Target {
    LinuxIntel64,
    MacOsArm64,
    Wasm32,
}

impl Target {
    pub const ALL: [Target; 3] = [Target::LinuxIntel64, Target::MacOsArm64, Target::Wasm32];

    pub fn from(arch: Arch, word_size: WordSize, os: Option<TargetOs>) -> Option<Self> {
        match (arch, word_size, os) {
            (Arch::Intel, WordSize::W64, Some(TargetOs::Linux)) => Some(Target::LinuxIntel64),
            (Arch::Arm, WordSize::W64, Some(TargetOs::MacOs)) => Some(Target::MacOsArm64),
            (Arch::Wasm, WordSize::W32, Some(TargetOs::Wasm)) => Some(Target::Wasm32),
            _ => None,
        }
    }
    pub fn word_size(&self) -> WordSize {
        match self {
            Target::LinuxIntel64 => WordSize::W64,
            Target::MacOsArm64 => WordSize::W64,
            Target::Wasm32 => WordSize::W32,
        }
    }
    pub fn arch(&self) -> Arch {
        match self {
            Target::LinuxIntel64 => Arch::Intel,
            Target::MacOsArm64 => Arch::Arm,
            Target::Wasm32 => Arch::Wasm,
        }
    }
    pub fn name(&self) -> &'static str {
        match self {
            Target::LinuxIntel64 => "linux-intel64",
            Target::MacOsArm64 => "macos-arm64",
            Target::Wasm32 => "wasm32",
        }
    }
}

pub const DEFAULT_MAX_DIRECT_SCALARS: u32 = 4;

/// Everything the lowering pipeline is parameterized over
#[derive(Debug, Clone)]
pub struct LowerConfig {
    pub target: Target,
    /// Aggregates whose explosion is wider than this are returned indirectly
    pub max_direct_scalars: u32,
    /// Number of worker threads bodies are distributed over; 1 lowers on the calling thread
    pub workers: usize,
}

impl LowerConfig {
    pub fn for_target(target: Target) -> LowerConfig {
        LowerConfig { target, max_direct_scalars: DEFAULT_MAX_DIRECT_SCALARS, workers: 1 }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the lowered IR of a scenario
    Dump { scenario: String },
    /// Lower a scenario and execute its entry point in the reference interpreter
    Run { scenario: String },
    /// Print the ABI classification of every function in a scenario
    Abi { scenario: String },
    /// List the available scenarios
    List,
}

impl Command {
    pub fn scenario(&self) -> Option<&str> {
        match self {
            Command::Dump { scenario } => Some(scenario),
            Command::Run { scenario } => Some(scenario),
            Command::Abi { scenario } => Some(scenario),
            Command::List => None,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target platform; defaults to the host
    #[arg(long, value_enum)]
    pub target: Option<Target>,

    /// Worker threads used to lower function bodies
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Explosion width above which aggregates are returned indirectly
    #[arg(long, default_value_t = DEFAULT_MAX_DIRECT_SCALARS)]
    pub max_direct_scalars: u32,

    /// Debug-level logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn config(&self) -> Result<LowerConfig> {
        let Some(target) = self.target.or(detect_host_target()) else {
            bail!("Unsupported host platform; provide your target explicitly")
        };
        Ok(LowerConfig {
            target,
            max_direct_scalars: self.max_direct_scalars,
            workers: self.workers.max(1),
        })
    }
}

pub fn find_scenario(name: &str) -> Result<Scenario> {
    match scenarios::find_scenario(name) {
        Some(s) => Ok(s),
        None => bail!("No scenario named '{}'; try `list`", name),
    }
}

pub fn compile_scenario(scenario: &Scenario, config: &LowerConfig) -> Result<IrModule> {
    let lower_time = std::time::Instant::now();
    let module = match lower_program(&scenario.program, config) {
        Ok(module) => module,
        Err(e) => {
            write_error(&mut std::io::stderr(), scenario.name, &e)?;
            bail!(e)
        }
    };
    info!(
        "lowered '{}' for {} in {}us",
        scenario.name,
        config.target.name(),
        lower_time.elapsed().as_micros()
    );
    Ok(module)
}

pub fn run_scenario(scenario: &Scenario, config: &LowerConfig) -> Result<Vec<u64>> {
    let module = compile_scenario(scenario, config)?;
    let mut vm = Vm::make(&module);
    let args = scenario.args.clone();
    let result = match vm.call_symbol(scenario.entry, &args) {
        Ok(r) => r,
        Err(e) => bail!("{}: {}", scenario.name, e),
    };
    info!("'{}' returned {:?} ({} heap objects live)", scenario.name, result, vm.live_objects());
    Ok(result.to_vec())
}

pub fn describe_scenario_abi(scenario: &Scenario, config: &LowerConfig) -> Result<String> {
    use std::fmt::Write;
    let program = &scenario.program;
    let caches = LowerCaches::new(config);
    let classifier = AbiClassifier::new(&program.types, &caches, config.target);
    let mut s = String::new();
    for (function_id, decl) in program.iter_functions() {
        if decl.is_builtin || !decl.generic_params.is_empty() {
            continue;
        }
        let signature = decl.signature();
        let abi = match classifier.classify_declaration(&signature) {
            Ok(abi) => abi,
            Err(e) => {
                write_error(&mut std::io::stderr(), scenario.name, &e)?;
                bail!(e)
            }
        };
        writeln!(s, "{} (#{}) [{}]", program.idents.get_name(decl.name), function_id, decl.conv)?;
        for p in abi.params.iter() {
            let plan = match &p.plan {
                ArgPlan::Direct => "direct".to_string(),
                ArgPlan::Coerced { scalars } => {
                    format!("coerced({})", scalars.iter().map(|s| s.short_name()).join(", "))
                }
                ArgPlan::Byval { layout } => format!("byval(align {})", layout.align),
                ArgPlan::IndirectCopy { layout } => format!("indirect copy(size {})", layout.size),
            };
            let param_type = program.types.type_to_string(p.type_id, &program.idents);
            writeln!(s, "  param {}: {}", param_type, plan)?;
        }
        let result = match &abi.result {
            ResultPlan::Direct => "direct".to_string(),
            ResultPlan::Coerced { scalars } => format!("coerced({} scalars)", scalars.len()),
            ResultPlan::Indirect { layout } => format!("sret(align {})", layout.align),
        };
        writeln!(
            s,
            "  result {}: {}",
            program.types.type_to_string(abi.result_type, &program.idents),
            result
        )?;
        writeln!(s, "  lowered: {}", abi.lowered)?;
    }
    Ok(s)
}
