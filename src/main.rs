//! Stackpar CLI - Parallel Processing for Image Stacks
//!
//! A demonstration CLI: plans and runs the dispatch strategies over synthetic
//! stacks.

use anyhow::{bail, Context};
use stackpar::core::config::{ENV_CHUNKSIZE, ENV_CORES, ENV_SYNC};
use stackpar::prelude::*;
use std::sync::Arc;
use std::time::Instant;

fn main() {
    env_logger::init();

    println!("🧮 Stackpar - Parallel Processing for Image Stacks v{}", stackpar::VERSION);
    println!();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return;
    }

    let outcome = match args[1].as_str() {
        "info" => show_info(),
        "plan" => plan_command(&args[2..]),
        "run" => run_command(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage(&args[0]);
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(&args[0]);
            Ok(())
        }
    };

    if let Err(e) = outcome {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  info                    Show host facts and configuration");
    println!("  plan <n> [options]      Print the execution plan for n planes as JSON");
    println!("  run <n> <h> <w> [options]  Process a synthetic n x h x w stack");
    println!("  help                    Show this help message");
    println!();
    println!("Options:");
    println!("  --strategy <kind>   copy, inplace or paired (default: inplace)");
    println!("  --cores <n>         Worker count (default: all logical cores)");
    println!("  --chunksize <n>     Planes per unit of work (default: 1)");
    println!("  --config <file>     Load settings from a TOML file");
    println!("  --sync              Run on the calling thread");
    println!();
    println!("Environment:");
    println!("  {}  {}  {}", ENV_CORES, ENV_CHUNKSIZE, ENV_SYNC);
}

/// Options shared by `plan` and `run`, parsed after the positional arguments.
struct Options {
    config: EngineConfig,
    strategy: StrategyKind,
}

fn parse_options(args: &[String]) -> anyhow::Result<Options> {
    let mut config_path = None;
    let mut cores = None;
    let mut chunk_size = None;
    let mut sync = false;
    let mut strategy = StrategyKind::InPlaceSingle;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                config_path = Some(args[i + 1].clone());
                i += 2;
            }
            "--cores" if i + 1 < args.len() => {
                cores = Some(parse_count("--cores", &args[i + 1])?);
                i += 2;
            }
            "--chunksize" if i + 1 < args.len() => {
                chunk_size = Some(parse_count("--chunksize", &args[i + 1])?);
                i += 2;
            }
            "--strategy" if i + 1 < args.len() => {
                strategy = parse_strategy(&args[i + 1])?;
                i += 2;
            }
            "--sync" => {
                sync = true;
                i += 1;
            }
            other => bail!("Unknown option: {}", other),
        }
    }

    let mut config = match config_path {
        Some(path) => EngineConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => EngineConfig::default(),
    };
    config = config.with_env_overrides()?;
    if let Some(cores) = cores {
        config = config.with_cores(cores);
    }
    if let Some(chunk_size) = chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    if sync {
        config = config.with_force_sequential(true);
    }

    Ok(Options { config, strategy })
}

fn parse_count(flag: &str, value: &str) -> anyhow::Result<usize> {
    value
        .parse()
        .with_context(|| format!("{} expects a non-negative integer, got {:?}", flag, value))
}

fn parse_strategy(value: &str) -> anyhow::Result<StrategyKind> {
    match value {
        "copy" => Ok(StrategyKind::Copy),
        "inplace" | "in-place" => Ok(StrategyKind::InPlaceSingle),
        "paired" => Ok(StrategyKind::PairedTwoArray),
        _ => bail!("Unknown strategy {:?}; expected copy, inplace or paired", value),
    }
}

fn show_info() -> anyhow::Result<()> {
    let host = HostInfo::detect();
    let config = EngineConfig::default().with_env_overrides()?;

    println!("Host:");
    println!("  • Logical cores: {}", host.logical_cores);
    match SystemMemory.free_bytes() {
        u64::MAX => println!("  • Free memory: unknown"),
        bytes => println!("  • Free memory: {} MB", bytes / (1024 * 1024)),
    }
    println!();
    println!("Configuration:");
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn plan_command(args: &[String]) -> anyhow::Result<()> {
    let Some(n) = args.first() else {
        bail!("Please specify the number of planes");
    };
    let n = parse_count("<n>", n)?;
    let options = parse_options(&args[1..])?;

    let engine = Engine::new(options.config, HostInfo::detect(), Arc::new(SystemMemory));
    let plan = engine.plan_for(n, options.strategy);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn run_command(args: &[String]) -> anyhow::Result<()> {
    if args.len() < 3 {
        bail!("Please specify the stack shape: run <n> <h> <w>");
    }
    let shape = StackShape::new(
        parse_count("<n>", &args[0])?,
        parse_count("<h>", &args[1])?,
        parse_count("<w>", &args[2])?,
    );
    let options = parse_options(&args[3..])?;

    let engine = Engine::new(options.config, HostInfo::detect(), Arc::new(SystemMemory));
    let len = shape.checked_len()?;
    let stack = ImageStack::from_vec(shape, (0..len).map(|i| (i % 251) as f32).collect())?;

    let mut progress = ProgressTracker::new().with_callback(Box::new(|update: ProgressUpdate| match update {
        ProgressUpdate::Started { total_units } => {
            println!("⚙️  Processing {} planes", total_units);
        }
        ProgressUpdate::Completed {
            total_duration_ms,
            completed_units,
        } => {
            println!("✅ Complete in {}ms ({} planes)", total_duration_ms, completed_units);
        }
        ProgressUpdate::Failed { message, .. } => {
            eprintln!("❌ Error: {}", message);
        }
        _ => {}
    }));

    println!("📐 Stack {} with {:?}", shape, options.strategy);
    let start = Instant::now();

    let output = match options.strategy {
        StrategyKind::Copy => {
            let square = |plane: &[f32], _: PlaneShape| -> anyhow::Result<Vec<f32>> {
                Ok(plane.iter().map(|v| v * v).collect())
            };
            engine.execute(stack, Strategy::copy(&square), &mut progress)?
        }
        StrategyKind::InPlaceSingle => {
            let factor = 2.0f32;
            let scale = move |plane: &mut [f32], _: PlaneShape| -> anyhow::Result<()> {
                plane.iter_mut().for_each(|v| *v *= factor);
                Ok(())
            };
            engine.execute(stack, Strategy::in_place(&scale), &mut progress)?
        }
        StrategyKind::PairedTwoArray => {
            let dark = ImageStack::from_vec(shape, vec![1.0; len])?;
            let subtract = |plane: &mut [f32], dark: Secondary<'_>, _: PlaneShape| -> anyhow::Result<()> {
                for (v, d) in plane.iter_mut().zip(dark.as_slice()) {
                    *v -= d;
                }
                Ok(())
            };
            engine.execute(
                stack,
                Strategy::paired(&dark, Forwarding::PerIndex, &subtract),
                &mut progress,
            )?
        }
    };

    let checksum: f64 = output.as_slice().iter().map(|&v| v as f64).sum();
    println!("🎉 Result {} checksum {:.3} in {:?}", output.shape(), checksum, start.elapsed());
    if engine.manager().live_count() > 0 {
        eprintln!("⚠️  {} shared segment(s) still live", engine.manager().live_count());
    }
    Ok(())
}
