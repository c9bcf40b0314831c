mod assets;
mod binary_utils;
mod formats;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use formats::SilverError;

/// Convert between SilverDB firmware asset databases and loose PNG files.
#[derive(Parser)]
#[command(name = "silverpack", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a SilverDB blob into a directory of editable assets
    Unpack {
        /// Path to the SilverDB binary
        input: PathBuf,
        /// Directory to write PNGs, empty markers and table.json into
        output: PathBuf,
    },
    /// Build a SilverDB blob from a directory of loose assets
    Pack {
        /// Directory holding `<id>_<tag>.png` / `<id>_empty.bin` files
        input: PathBuf,
        /// Path for the packed SilverDB binary
        output: PathBuf,
    },
}

fn run(cli: Cli) -> Result<(), SilverError> {
    match cli.command {
        Command::Unpack { input, output } => {
            println!("Unpacking {} -> {}", input.display(), output.display());
            let data = fs::read(&input)?;
            let report = assets::unpack_to_directory(&data, &output)?;

            println!(
                "Unpacked {} entries ({} references).",
                report.entries.len(),
                report.references.len()
            );
            for warning in &report.warnings {
                eprintln!("Warning: {}", warning);
            }
            if !report.unhandled_formats.is_empty() {
                let tags: Vec<String> = report
                    .unhandled_formats
                    .iter()
                    .map(|tag| format!("0x{:04x}", tag))
                    .collect();
                eprintln!("Formats left unhandled: {}", tags.join(", "));
            }
            if report.language.is_some() {
                println!("Language table: body written unparsed.");
            }
        }
        Command::Pack { input, output } => {
            println!("Packing {} -> {}", input.display(), output.display());
            let blob = assets::pack_directory(&input)?;
            fs::write(&output, &blob)?;
            println!("Wrote {} bytes.", blob.len());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
