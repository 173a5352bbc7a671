use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

mod compiler;
mod config;
mod vm;

use config::{EngineManifest, MetricsFormat, RuntimeConfig};
use vm::{Machine, RunReport, SourceKind};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum MetricsFormatArg {
    #[default]
    Human,
    Json,
}

impl From<MetricsFormatArg> for MetricsFormat {
    fn from(arg: MetricsFormatArg) -> Self {
        match arg {
            MetricsFormatArg::Human => MetricsFormat::Human,
            MetricsFormatArg::Json => MetricsFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "A stack-based bytecode engine with an execution profiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a program
    Run {
        /// The source file to run (defaults to the vm.toml entry if present)
        file: Option<PathBuf>,

        /// Execute source directly from the command line
        #[arg(short = 'c', long)]
        code: Option<String>,

        /// Treat the source as an arithmetic expression instead of assembly
        #[arg(long)]
        expr: bool,

        /// Visit count a pc must exceed to become a JIT candidate
        #[arg(long)]
        jit_threshold: Option<u64>,

        /// Instruction budget (bounds non-terminating programs)
        #[arg(long)]
        max_instructions: Option<u64>,

        /// Trace hot-spot detection events
        #[arg(long)]
        trace_jit: bool,

        /// Print the execution trace, one line per instruction
        #[arg(long)]
        trace: bool,

        /// Print the hot-spot profile after the run
        #[arg(long)]
        profile: bool,

        /// Print run metrics (human or json format)
        #[arg(long, value_enum, require_equals = true, num_args = 0..=1, default_missing_value = "human")]
        metrics: Option<MetricsFormatArg>,
    },
    /// Compile a source file without running it
    Check {
        /// The source file to check
        file: PathBuf,
    },
    /// Compile a source file and print its instruction listing
    Disasm {
        /// The source file to disassemble
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            code,
            expr,
            jit_threshold,
            max_instructions,
            trace_jit,
            trace,
            profile,
            metrics,
        } => {
            let manifest = load_manifest();
            let mut config = manifest
                .as_ref()
                .map(|m| m.runtime_config())
                .unwrap_or_default();
            if let Some(threshold) = jit_threshold {
                config.jit_threshold = threshold;
            }
            if let Some(budget) = max_instructions {
                config.max_instructions = budget;
            }
            config.trace_jit = config.trace_jit || trace_jit;

            let report = match compile_and_run(file, code, expr, &manifest, &config) {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };

            if trace {
                print_trace(&report);
            }
            if let Some(top) = report.state.stack.last() {
                println!("{}", top);
            }
            if profile {
                print_profile(&report);
            }
            if let Some(format) = metrics {
                match MetricsFormat::from(format) {
                    MetricsFormat::Human => print!("{}", report.metrics.render_human()),
                    MetricsFormat::Json => println!("{}", report.metrics.render_json()),
                }
            }

            if let Some(fault) = &report.state.error {
                eprintln!("runtime fault: {}", fault);
                return ExitCode::FAILURE;
            }
        }
        Commands::Check { file } => {
            if let Err(e) = compiler::compile_file(&file) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Disasm { file } => match compiler::compile_file(&file) {
            Ok(program) => print!("{}", program.disassemble()),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}

fn load_manifest() -> Option<EngineManifest> {
    let cwd = std::env::current_dir().ok()?;
    EngineManifest::load(&cwd).ok()
}

fn compile_and_run(
    file: Option<PathBuf>,
    code: Option<String>,
    expr: bool,
    manifest: &Option<EngineManifest>,
    config: &RuntimeConfig,
) -> Result<RunReport, String> {
    if let Some(source) = code {
        let kind = if expr {
            SourceKind::Expression
        } else {
            SourceKind::Assembly
        };
        return compiler::run_source(&source, kind, config);
    }

    let path = match file {
        Some(path) => path,
        None => match manifest.as_ref().and_then(|m| m.engine.entry.as_ref()) {
            Some(entry) => PathBuf::from(entry),
            None => {
                return Err("no file specified and no vm.toml entry found".to_string());
            }
        },
    };

    let program = if expr {
        let source = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        compiler::compile(&source, SourceKind::Expression).map_err(|e| e.to_string())?
    } else {
        compiler::compile_file(&path)?
    };

    let mut machine = Machine::with_config(config.clone());
    machine.load(program);
    Ok(machine.run())
}

fn print_trace(report: &RunReport) {
    println!("  pc  instruction       stack after");
    for step in &report.trace {
        let stack: Vec<String> = step
            .state_after
            .stack
            .iter()
            .map(|v| v.to_string())
            .collect();
        println!(
            "{:4}  {:<16}  [{}]",
            step.instruction.address,
            step.instruction.to_string(),
            stack.join(", ")
        );
    }
}

fn print_profile(report: &RunReport) {
    println!("hot spots:");
    for spot in &report.profile.hot_spots {
        println!(
            "  pc {:4}  {:8} visits  ({:.1}%)",
            spot.pc, spot.count, spot.percentage
        );
    }

    if !report.profile.compilation_candidates.is_empty() {
        println!("jit candidates:");
        for pc in &report.profile.compilation_candidates {
            println!("  pc {}", pc);
        }
    }

    if !report.profile.optimizations.is_empty() {
        println!("suggested optimizations:");
        for optimization in &report.profile.optimizations {
            println!(
                "  pc {:4}  {:?}: {}",
                optimization.pc, optimization.kind, optimization.description
            );
        }
    }
}
