// File: src/main.rs
//
// Command-line driver for the Hemlock interpreter. Compiles a script and
// runs it on a fresh VM; `hemlock run <file>` and the bare `hemlock <file>`
// form are equivalent. Trailing arguments are bound to the global `args`.

mod ast;
mod async_runtime;
mod builtins;
mod bytecode;
mod compiler;
mod disassembler;
mod errors;
mod intrinsics;
mod lexer;
mod parser;
mod value;
mod vm;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};

use crate::errors::render_runtime_error;
use crate::value::Value;
use crate::vm::Vm;

#[derive(ClapParser)]
#[command(
    name = "hemlock",
    about = "Hemlock: a dynamically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the .hk script (shorthand for `hemlock run <file>`)
    file: Option<PathBuf>,

    /// Print each executed instruction to stderr
    #[arg(long)]
    trace: bool,

    /// Disassemble the compiled program and exit
    #[arg(long)]
    dump_bytecode: bool,

    /// Arguments passed through to the script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    script_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a Hemlock script
    Run {
        /// Path to the script file
        file: PathBuf,

        /// Print each executed instruction to stderr
        #[arg(long)]
        trace: bool,

        /// Disassemble the compiled program and exit
        #[arg(long)]
        dump_bytecode: bool,

        /// Arguments passed through to the script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        script_args: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (file, trace, dump_bytecode, script_args) = match cli.command {
        Some(Commands::Run { file, trace, dump_bytecode, script_args }) => {
            (file, trace, dump_bytecode, script_args)
        }
        None => match cli.file {
            Some(file) => (file, cli.trace, cli.dump_bytecode, cli.script_args),
            None => {
                eprintln!("Usage: hemlock [--trace] [--dump-bytecode] <file> [args...]");
                return ExitCode::from(1);
            }
        },
    };

    let source = match fs::read_to_string(&file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to read {}: {}", file.display(), e);
            return ExitCode::from(1);
        }
    };
    let filename = file.to_string_lossy().to_string();

    let program = match parser::parse_program(&source) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{}", e.with_file(filename));
            return ExitCode::from(1);
        }
    };

    let chunk = match compiler::compile_program(&program) {
        Ok(chunk) => chunk,
        Err(errors) => {
            for error in errors {
                eprintln!("{}", error.clone().with_file(filename.clone()));
            }
            return ExitCode::from(1);
        }
    };

    if dump_bytecode {
        print!("{}", disassembler::disassemble_chunk(&chunk, "<script>"));
        return ExitCode::SUCCESS;
    }

    let mut vm = Vm::new();
    vm.trace = trace;
    let args_value = Value::array(script_args.into_iter().map(Value::str).collect());
    vm.globals.define("args", args_value, false);

    match vm.interpret(chunk) {
        Ok(_) => ExitCode::SUCCESS,
        Err(uncaught) => {
            eprintln!("{}", render_runtime_error(&uncaught.message, &uncaught.trace));
            ExitCode::from(1)
        }
    }
}
