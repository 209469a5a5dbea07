use std::fs;
use std::io::{self, BufReader};

use clap::Parser as ClapParser;
use tinylang::analyzer;
use tinylang::disasm;
use tinylang::machine::Machine;

/// Compiler and bytecode interpreter for the toy imperative language.
#[derive(ClapParser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Source file to compile and run
    source: String,

    /// Dump the compiled bytecode instead of running it
    #[arg(long, default_value_t = false)]
    dump_bytecode: bool,

    /// Print opcode-frequency statistics instead of running
    #[arg(short, long, default_value_t = false)]
    frequency: bool,
}

/// Bind the small set of host functions a standalone run gets for free:
/// `sqrt` and `abs`, both one-argument numeric foreigns. Each pops its
/// argument off the operand stack and pushes exactly one result, matching
/// the calling convention every `CALLF` site compiles against.
fn register_host_functions(machine: &mut Machine) {
    machine.register_foreign(
        "sqrt",
        Box::new(|vm| {
            let pc = vm.pc();
            let arg = vm.pop(pc)?;
            let n = vm.number_at(arg, pc)?;
            let result = vm.alloc_number(n.sqrt());
            vm.push(result, pc)
        }),
    );
    machine.register_foreign(
        "abs",
        Box::new(|vm| {
            let pc = vm.pc();
            let arg = vm.pop(pc)?;
            let n = vm.number_at(arg, pc)?;
            let result = vm.alloc_number(n.abs());
            vm.push(result, pc)
        }),
    );
}

/// Run the CLI, reporting exactly one diagnostic line on any fatal error.
/// Kept separate from `main` so the `?`-propagation stays readable while
/// `main` is the only place that turns an `Err` into a process exit code.
fn try_main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let source = fs::read_to_string(&args.source)?;

    let stdin = BufReader::new(io::stdin());
    let stdout = io::stdout();
    let mut machine = Machine::init(Box::new(stdin), Box::new(stdout));
    register_host_functions(&mut machine);

    machine.compile(&source)?;

    if args.dump_bytecode || args.frequency {
        let listing = disasm::disassemble(machine.program())?;
        if args.frequency {
            println!("{}", analyzer::analyze(&listing));
        } else {
            println!("{listing}");
        }
        return Ok(());
    }

    machine.run()?;
    Ok(())
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
