use clap::Parser;
use px86_assembler::{parse_unsigned, Assembler, Disassembler};
use std::path::PathBuf;

#[derive(Parser)]
struct Args {
    input: PathBuf,
    output: PathBuf,
    #[clap(long, short)]
    disassemble: bool,
    /// Address the image is loaded at
    #[clap(long, short, default_value = "0", value_parser = parse_unsigned::<u32>)]
    origin: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Args {
        input,
        output,
        disassemble,
        origin,
    } = Args::parse();

    if disassemble {
        let image = std::fs::read(&input)?;
        let listing = Disassembler::new().disassemble_program(&image, origin);
        std::fs::write(&output, listing)
            .map_err(|e| format!("Failed to write output file '{}': {e}", output.display()))?;
    } else {
        let program = std::fs::read_to_string(&input)?;
        let mut assembler = Assembler::with_origin(origin);
        let image = assembler.assemble_program(&program)?;
        std::fs::write(&output, image)
            .map_err(|e| format!("Failed to write output file '{}': {e}", output.display()))?;
    }

    Ok(())
}
