use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use oba::vm::VM;

/// Run an Oba program.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the Oba source file to run.
    script: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let source = match fs::read_to_string(&args.script) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Error: could not read {}: {error}", args.script.display());
            return ExitCode::from(74);
        }
    };

    let mut vm = VM::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => ExitCode::from(error.exit_code()),
    }
}
