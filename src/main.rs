use std::{env, fs, process};

use colored::Colorize;

use spasm::emulator::Emulator;
use spasm::parser::Parser;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <program-file> [args...]", args[0]);
        process::exit(1);
    }

    let path = &args[1];
    let source = fs::read(path).unwrap_or_else(|err| {
        eprintln!("{} failed to read {}: {}", "error:".red().bold(), path, err);
        process::exit(1);
    });

    let mut parser = Parser::new(args[2..].to_vec());
    let prog = parser
        .parse_source(&source, path)
        .and_then(|_| parser.get_program(true))
        .unwrap_or_else(|err| {
            parser.report_error(&err);
            process::exit(1);
        });

    let ctx = parser.get_output_context();
    let mut emulator = Emulator::new(prog, ctx);
    if let Err(err) = emulator.run() {
        eprintln!("{} {}", "error:".red().bold(), err);
        process::exit(1);
    }
}
