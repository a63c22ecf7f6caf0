mod chunk;
mod cli_reporter;
mod compiler;
mod heap;
mod natives;
mod object;
mod reporter;
mod table;
mod token;
mod tokenizer;
mod value;
mod vm;

use cli_reporter::CliReporter;
use rustyline::Editor;
use std::{env, fs, process};
use vm::{InterpretError, Vm};

fn main() {
    let mut args = env::args().skip(1);
    match (args.next(), args.next()) {
        (None, _) => repl(),
        (Some(path), None) => run_file(&path),
        _ => {
            eprintln!("Usage: cinder [script]");
            process::exit(exitcode::USAGE);
        }
    }
}

fn run_file(path: &str) {
    let source = fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Could not read \"{path}\": {err}");
        process::exit(exitcode::IOERR);
    });

    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match vm.interpret(&source, &mut reporter) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(exitcode::DATAERR),
        Err(InterpretError::Runtime) => process::exit(exitcode::SOFTWARE),
    }
}

fn repl() {
    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                vm.interpret(&line, &mut reporter).ok();
            }
            Err(_) => break,
        }
    }
}
