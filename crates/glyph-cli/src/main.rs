//! Command-line driver for the glyph virtual machine.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use glyph_vm::{Vm, VmError, VmOptions};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read program: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Vm(#[from] VmError),
}

#[derive(Parser)]
#[command(name = "glyph", version)]
#[command(about = "Stack machine for glyph bytecode programs", long_about = None)]
struct Cli {
    /// Program file; read from stdin when omitted
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Print the PC, the opcode, and the top of the stack before each step
    #[arg(short, long)]
    trace: bool,

    /// Log branch-optimizer decisions during the prescan
    #[arg(long)]
    debug_branches: bool,

    /// Stop after this many steps (0 = run to termination)
    #[arg(long, default_value = "0", value_name = "N")]
    max_steps: u64,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug_branches {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let program = read_program(cli.file.as_ref())?;

    let options = VmOptions {
        branch_debug: cli.debug_branches,
    };
    let mut vm = Vm::with_output(program, options, io::stdout().lock());

    loop {
        if cli.max_steps != 0 && vm.steps() >= cli.max_steps {
            break;
        }
        if cli.trace {
            print_trace(&vm);
        }
        if vm.step()? {
            break;
        }
    }

    if cli.trace {
        println!("DONE.  {} steps", vm.steps());
    } else {
        println!("DONE");
    }
    Ok(())
}

/// Reads the program from a file or stdin. Lines are joined with a single
/// space byte so line breaks keep their whitespace meaning in the image.
fn read_program(file: Option<&PathBuf>) -> Result<Vec<u8>, CliError> {
    let lines: Vec<String> = match file {
        Some(path) => fs::read_to_string(path)?
            .lines()
            .map(str::to_owned)
            .collect(),
        None => io::stdin().lock().lines().collect::<io::Result<_>>()?,
    };
    Ok(lines.join(" ").into_bytes())
}

/// One trace line: PC, the byte under it, and up to five top stack values.
fn print_trace<W: Write>(vm: &Vm<W>) {
    let mut line = format!("PC={} '{}'", vm.pc(), vm.byte_at(vm.pc()) as char);
    for val in vm.stack().iter().rev().take(5) {
        line.push(' ');
        line.push_str(&val.to_string());
    }
    println!("{line}");
}
