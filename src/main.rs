//! Marrow CLI: compile and run a serialized syntax tree.

use std::env;
use std::fs;
use std::io;
use std::process;

use colored::Colorize;
use tracing_subscriber::EnvFilter;

use marrow::ast::{AstArena, TreeDocument};
use marrow::config::VmConfig;
use marrow::error::MarrowError;
use marrow::vm::{self, Compiler, Vm, WriterTrace};

const VERSION: &str = env!("CARGO_PKG_VERSION", "0.1.0");

/// CLI options parsed from arguments.
struct Options {
    file: String,
    config: VmConfig,
    trace: bool,
    disassemble: bool,
}

fn print_usage() {
    eprintln!("Marrow {} - bytecode VM", VERSION);
    eprintln!();
    eprintln!("Usage: marrow [options] <tree.json>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --trace            Print every instruction to stderr as it executes");
    eprintln!("  --disassemble      Print the compiled bytecode before running");
    eprintln!("  --max-frames N     Call depth limit (default: {})", marrow::config::DEFAULT_MAX_FRAMES);
    eprintln!("  --gc-threshold N   Live objects before the first collection");
    eprintln!("  --gc-stress        Collect before every allocating instruction");
    eprintln!("  --help, -h         Show this help message");
    eprintln!("  --version, -V      Show the version");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  MARROW_LOG           Log level (error, warn, info, debug, trace)");
    eprintln!("  MARROW_MAX_FRAMES    Default for --max-frames");
    eprintln!("  MARROW_GC_THRESHOLD  Default for --gc-threshold");
    eprintln!("  MARROW_GC_STRESS     Default for --gc-stress");
}

fn usage_error(message: &str) -> ! {
    eprintln!("{}", message);
    print_usage();
    process::exit(64);
}

fn numeric_arg(args: &[String], i: usize, flag: &str) -> usize {
    match args.get(i).map(|value| value.parse::<usize>()) {
        Some(Ok(n)) => n,
        Some(Err(_)) => usage_error(&format!("{} expects a number", flag)),
        None => usage_error(&format!("{} requires a value", flag)),
    }
}

fn parse_args() -> Options {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut config = VmConfig::from_env();
    let mut file = None;
    let mut trace = false;
    let mut disassemble = false;

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        match arg.as_str() {
            "--trace" => trace = true,
            "--disassemble" => disassemble = true,
            "--gc-stress" => config = config.gc_stress(true),
            "--max-frames" => {
                i += 1;
                config = config.max_frames(numeric_arg(&args, i, "--max-frames"));
            }
            "--gc-threshold" => {
                i += 1;
                config = config.gc_threshold(numeric_arg(&args, i, "--gc-threshold"));
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            "--version" | "-V" => {
                println!("marrow {}", VERSION);
                process::exit(0);
            }
            _ if arg.starts_with('-') => usage_error(&format!("Unknown option: {}", arg)),
            _ => {
                if file.is_some() {
                    usage_error("Only one tree file can be specified");
                }
                file = Some(arg.clone());
            }
        }
        i += 1;
    }

    let Some(file) = file else {
        usage_error("No tree file given");
    };
    Options {
        file,
        config,
        trace,
        disassemble,
    }
}

/// Diagnostics go to stderr, filtered by `MARROW_LOG` (default `warn`).
fn init_logging() {
    let filter = EnvFilter::try_from_env("MARROW_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .without_time()
        .try_init();
}

fn load(path: &str) -> Result<vm::CompiledProgram, MarrowError> {
    let text = fs::read_to_string(path)?;
    let document = TreeDocument::from_json(&text)?;
    let arena = AstArena::new();
    let root = document.build(&arena)?;
    tracing::debug!(bytes = arena.allocated_bytes(), "tree loaded into arena");
    let source = if document.source == "<tree>" {
        path.to_string()
    } else {
        document.source.clone()
    };
    Ok(Compiler::compile(root, source)?)
}

fn main() {
    init_logging();
    let options = parse_args();

    let program = match load(&options.file) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{} {}", "Error:".red().bold(), err);
            let code = match err {
                MarrowError::Io(_) => 66,
                _ => 65,
            };
            process::exit(code);
        }
    };

    if options.disassemble {
        println!("{}", vm::disassemble(&program));
        println!("---");
    }

    let mut machine = Vm::with_config(options.config);
    if options.trace {
        machine.set_tracer(Box::new(WriterTrace::new(io::stderr())));
    }
    let status = match machine.execute(&program) {
        Ok(_) => vm::ExitStatus::Success,
        Err(err) => {
            eprintln!("{} {}", "Error:".red().bold(), err);
            vm::ExitStatus::from(&Err::<(), _>(err))
        }
    };
    process::exit(status.code());
}
