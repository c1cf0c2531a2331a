//! Assembly to bytecode compiler CLI.
//!
//! Reads an assembly source file and writes an executable bytecode image.
//!
//! # Usage
//! ```text
//! asm [--debug] <infile> [<outfile>]
//! ```
//!
//! Without `<outfile>` the image is written to `out.bin`. Exit code 0 on
//! success, 1 on any fatal assembly error.

use std::env;
use std::fs;
use std::process;
use tatanka::assembler::assemble_file;
use tatanka::errors::VmError;
use tatanka::utils::log;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        print_usage(&args[0]);
        process::exit(0);
    }

    let mut debug = false;
    let mut files: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "--debug" => debug = true,
            other if other.starts_with('-') => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
            other => files.push(other),
        }
    }

    if debug {
        log::init(log::Level::Debug);
    }

    let infile = match files.first() {
        Some(f) => *f,
        None => {
            eprintln!("fatal: no input file");
            process::exit(1);
        }
    };
    let outfile = files.get(1).copied().unwrap_or("out.bin");

    log::debug(&format!("asm: assembling `{}` to `{}`", infile, outfile));

    let program = match assemble_file(infile) {
        Ok(p) => p,
        Err(e @ VmError::IoError { .. }) => {
            eprintln!("fatal: {}", e);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("fatal: {}: {}", infile, e);
            process::exit(1);
        }
    };

    let bytes = match program.image().to_bytes() {
        Ok(b) => b,
        Err(e) => {
            eprintln!("fatal: {}: {}", infile, e);
            process::exit(1);
        }
    };

    if let Err(e) = fs::write(outfile, &bytes) {
        eprintln!("fatal: {}: {}", outfile, e);
        process::exit(1);
    }

    log::debug(&format!(
        "asm: wrote {} bytes ({} of code)",
        bytes.len(),
        program.size()
    ));
}

const USAGE: &str = "\
tatanka VM assembler, version {version}

USAGE:
    {program} [--debug] <infile> [<outfile>]

ARGS:
    <infile>     Assembly source file to compile
    <outfile>    Output image path (defaults to out.bin)

OPTIONS:
    --debug      Trace the assembly passes
    -h, --help   Print this help message
";

fn print_usage(program: &str) {
    eprintln!(
        "{}",
        USAGE
            .replace("{program}", program)
            .replace("{version}", env!("CARGO_PKG_VERSION"))
    );
}
