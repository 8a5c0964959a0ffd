use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use px86_assembler::{parse_unsigned, Assembler, Disassembler};
use px86_common::{
    Emulator, ExecutionReport, Machine, MachineConfig, RunMode, Tracer, DEFAULT_LOAD_LIMIT,
    DEFAULT_MEMORY_SIZE, DEFAULT_STACK_POINTER,
};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "px86", about = "Runs raw 32-bit x86 machine code")]
struct Args {
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    trace: bool,
    #[arg(short, long, global = true)]
    show_cpu_state: bool,
    #[arg(short, long, global = true, default_value_t = DEFAULT_MEMORY_SIZE, value_parser = parse_unsigned::<u32>)]
    memory_size: u32,
    #[arg(short, long, global = true, default_value_t = 0, value_parser = parse_unsigned::<u32>)]
    entrypoint: u32,
    #[arg(long, global = true, default_value_t = DEFAULT_STACK_POINTER, value_parser = parse_unsigned::<u32>)]
    stack_pointer: u32,
    /// Maximum number of bytes copied from the program image
    #[arg(short, long, global = true, default_value_t = DEFAULT_LOAD_LIMIT, value_parser = parse_unsigned::<usize>)]
    load_limit: usize,
    /// Stop after this many instructions
    #[arg(long, global = true, value_parser = parse_unsigned::<usize>)]
    max_steps: Option<usize>,
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Run a raw machine code image
    Run { path: PathBuf },
    /// Assemble a source file and run the result
    RunAsm { path: PathBuf },
    /// Print a listing of a raw machine code image
    Disasm { path: PathBuf },
}

#[derive(Debug, Default)]
struct PrintTracer {
    disassembler: Disassembler,
}

impl Tracer for PrintTracer {
    fn on_instruction(&mut self, instruction_pointer: u32, opcode: u8, machine: &Machine) {
        let code = &machine.memory().as_slice()[instruction_pointer as usize..];
        let text = self
            .disassembler
            .disassemble_instruction(code, instruction_pointer)
            .map(|(text, _)| text)
            .unwrap_or_default();
        println!("EIP = {instruction_pointer:x}, Code = {opcode:02x}  {text}");
    }
}

struct RunOptions {
    config: MachineConfig,
    load_limit: usize,
    max_steps: Option<usize>,
    verbose: bool,
    show_cpu_state: bool,
}

fn run_mode(max_steps: Option<usize>) -> RunMode {
    match max_steps {
        Some(steps) => RunMode::RunFor(steps),
        None => RunMode::Run,
    }
}

fn execute<T: Tracer>(emulator: &mut Emulator<T>, max_steps: Option<usize>) -> ExecutionReport {
    emulator.execute(run_mode(max_steps))
}

fn run(program: &[u8], options: &RunOptions) -> anyhow::Result<()> {
    let mut machine = Machine::new(options.config)?;
    let loaded = machine.load(0, program, options.load_limit)?;
    if loaded < program.len() {
        tracing::warn!(
            loaded,
            size = program.len(),
            "program image truncated to load limit"
        );
    }

    if options.show_cpu_state {
        println!("{machine}");
        println!();
    }

    let (report, machine) = if options.verbose {
        let mut emulator = Emulator::with_tracer(machine, PrintTracer::default());
        let report = execute(&mut emulator, options.max_steps);
        (report, emulator.into_machine())
    } else {
        let mut emulator = Emulator::new(machine);
        let report = execute(&mut emulator, options.max_steps);
        (report, emulator.into_machine())
    };

    println!();
    println!("========== RESULT/STATS ===========");
    println!();
    match report.halt {
        Some(halt) => println!("{halt}"),
        None => println!("step limit reached"),
    }
    println!("instructions executed: {}", report.stats.instructions);

    if options.show_cpu_state {
        println!();
        println!("{machine}");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let Args {
        verbose,
        trace,
        show_cpu_state,
        memory_size,
        entrypoint,
        stack_pointer,
        load_limit,
        max_steps,
        action,
    } = Args::parse();

    let level = if trace {
        LevelFilter::TRACE
    } else if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let options = RunOptions {
        config: MachineConfig {
            memory_size,
            entrypoint,
            stack_pointer,
        },
        load_limit,
        max_steps,
        verbose,
        show_cpu_state,
    };

    match action {
        Action::Run { path } => {
            let program = std::fs::read(&path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            run(&program, &options)?;
        }
        Action::RunAsm { path } => {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            let program = Assembler::new().assemble_program(&source)?;
            run(&program, &options)?;
        }
        Action::Disasm { path } => {
            let program = std::fs::read(&path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            print!("{}", Disassembler::new().disassemble_program(&program, 0));
        }
    }

    Ok(())
}
