use std::fs;
use std::io::Write;
use std::process::ExitCode;

use qvmd::{Qvm, decompile, load};

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(input), Some(output)) = (args.next(), args.next()) else {
        eprintln!("usage: qvmd <input-module> <output-path>");
        return ExitCode::from(2);
    };

    match run(&input, &output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("qvmd: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(input: &str, output: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading {input}...");
    let bytes = fs::read(input)?;
    let sections = load(&bytes)?;

    println!("Analyzing {} instructions...", sections.instruction_count);
    let qvm = Qvm::analyze(input, sections)?;

    println!("Decompiling to {output}...");
    let mut out = std::io::BufWriter::new(fs::File::create(output)?);
    decompile(&qvm, &mut out)?;
    out.flush()?;

    println!("Success.");
    Ok(())
}
