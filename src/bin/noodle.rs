use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Args as ClapArgs, Parser, Subcommand};
use log::LevelFilter;

use noodle::{Engine, EngineConfig, NoodleError, Primitive, Repl};

#[derive(Parser)]
#[command(author, version, about = "Noodle scripting language")]
struct Args {
    #[command(flatten)]
    limits: Limits,
    /// Log compiler and thread activity
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(ClapArgs)]
struct Limits {
    /// Maximum instructions a script may execute
    #[arg(long, global = true)]
    watchdog: Option<u64>,
    /// Operand stack capacity
    #[arg(long, global = true, default_value_t = EngineConfig::default().max_stack_depth)]
    max_stack: usize,
    /// Maximum nested script function calls
    #[arg(long, global = true, default_value_t = EngineConfig::default().max_call_depth)]
    max_calls: usize,
    /// Live objects a thread may hold before its heap is first collected
    #[arg(long, global = true, default_value_t = EngineConfig::default().gc_threshold)]
    gc_threshold: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Run a Noodle script; extra arguments are passed to the script as strings
    Run {
        script: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Evaluate a snippet of Noodle code and print its result
    Eval { source: String },
    /// Print the compiled instruction listing of a script
    Disasm { script: PathBuf },
    /// Start an interactive REPL session
    Repl,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    match execute(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn execute(args: Args) -> Result<(), NoodleError> {
    let config = EngineConfig {
        watchdog: args.limits.watchdog,
        max_stack_depth: args.limits.max_stack,
        max_call_depth: args.limits.max_calls,
        gc_threshold: args.limits.gc_threshold,
    };
    let engine = Arc::new(build_engine(config)?);
    match args.command.unwrap_or(Command::Repl) {
        Command::Run { script, args } => {
            let source = fs::read_to_string(&script)?;
            let arguments = args.into_iter().map(Primitive::from).collect();
            run_source(&engine, &script.to_string_lossy(), &source, arguments)?;
        }
        Command::Eval { source } => {
            let value = run_source(&engine, "<eval>", &source, Vec::new())?;
            if !value.is_null() {
                println!("{value}");
            }
        }
        Command::Disasm { script } => {
            let source = fs::read_to_string(&script)?;
            let program = engine.compile(&script.to_string_lossy(), &source)?;
            print!("{}", program.disassemble());
        }
        Command::Repl => Repl::new(engine).run()?,
    }
    Ok(())
}

fn build_engine(config: EngineConfig) -> Result<Engine, NoodleError> {
    Engine::builder()
        .config(config)
        .with_prelude()
        .register_builtin("print", 1, |ctx, args| {
            println!("{}", ctx.render(&args[0])?);
            Ok(Primitive::Null)
        })
        .build()
}

/// Compiles and runs `source`, rendering an object result through its template.
fn run_source(
    engine: &Arc<Engine>,
    name: &str,
    source: &str,
    arguments: Vec<Primitive>,
) -> Result<Primitive, NoodleError> {
    let program = Arc::new(engine.compile(name, source)?);
    let mut thread = engine.create_thread(&program, None, arguments)?;
    let value = thread.run()?;
    match value {
        Primitive::Object(_) => Ok(Primitive::string(engine.render(thread.heap(), &value)?)),
        other => Ok(other),
    }
}
