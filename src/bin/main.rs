//! Tooling for the compact log sandbox image

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use compact_log_decoder::wasm::engine::artifact_file_name;
use compact_log_decoder::wasm::{EngineConfig, SandboxImage, WasmCodeGen};
use compact_log_decoder::{CompactLogDecodeError, DecodeResult};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "compact-log-sandbox", version, about = "Build the compact log sandbox image")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the portable WebAssembly module
    EmitWasm {
        /// Output file
        output: PathBuf,
    },
    /// Write the native image for this machine into a directory
    Precompile {
        /// Directory the decoder loads artifacts from
        dir: PathBuf,
    },
}

fn main() -> DecodeResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::EmitWasm { output } => {
            let wasm_bytes = WasmCodeGen::new()
                .generate_validated()
                .map_err(CompactLogDecodeError::SandboxError)?;
            std::fs::write(&output, &wasm_bytes)?;

            println!("✓ Wrote {} ({} bytes)", output.display(), wasm_bytes.len());
        }
        Command::Precompile { dir } => {
            let config = EngineConfig::default().with_artifact_dir(&dir);
            let path = SandboxImage::write_artifact(&config, &dir)?;

            println!("✓ Wrote {}", path.display());
            println!(
                "Set COMPACT_LOG_ARTIFACT_DIR={} to load {}",
                dir.display(),
                artifact_file_name()
            );
        }
    }

    Ok(())
}
