//! Bytecode virtual machine CLI.
//!
//! Loads a bytecode image and runs it.
//!
//! # Usage
//! ```text
//! vm [--debug] <bytecode-file>
//! ```
//!
//! The process exit code is 1 on any runtime error, otherwise the integer
//! value of the return register at halt (0 if empty).

use std::env;
use std::fs;
use std::process;
use tatanka::program::ProgramImage;
use tatanka::utils::log;
use tatanka::vm::Vm;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let mut debug = false;
    let mut file: Option<&str> = None;
    for arg in &args[1..] {
        match arg.as_str() {
            "--debug" => debug = true,
            other if other.starts_with('-') => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
            other => {
                if file.is_some() {
                    eprintln!("Unexpected argument: {}\n", other);
                    print_usage(&args[0]);
                    process::exit(1);
                }
                file = Some(other);
            }
        }
    }

    let file = match file {
        Some(f) => f,
        None => {
            eprintln!("fatal: no bytecode file");
            process::exit(1);
        }
    };

    if debug {
        log::init(log::Level::Debug);
    }

    let bytes = match fs::read(file) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("fatal: {}: {}", file, e);
            process::exit(1);
        }
    };

    let image = match ProgramImage::from_bytes(&bytes) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("fatal: {}: {}", file, e);
            process::exit(1);
        }
    };

    log::debug(&format!(
        "vm: loaded {} bytes of code, executable offset {}",
        image.code.len(),
        image.executable_offset
    ));

    let mut vm = Vm::new(image);
    match vm.run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("exception: {}", e);
            process::exit(1);
        }
    }
}

const USAGE: &str = "\
tatanka VM, version {version}

USAGE:
    {program} [--debug] <bytecode-file>

ARGS:
    <bytecode-file>    Bytecode image produced by the assembler

OPTIONS:
    --debug            Trace instruction dispatch
    -h, --help         Print this help message
";

fn print_usage(program: &str) {
    eprintln!(
        "{}",
        USAGE
            .replace("{program}", program)
            .replace("{version}", env!("CARGO_PKG_VERSION"))
    );
}
