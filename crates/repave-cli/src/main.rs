use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use repave_core::Architecture;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "repave")]
#[command(about = "Offline tooling for the repave binary-patching engine")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify an image and print its layout
    Inspect {
        /// Path to the image file
        image: PathBuf,

        #[arg(long, default_value = "x86_64")]
        arch: Architecture,
    },
    /// Resolve exported symbols from an on-disk image
    Symbols {
        /// Path to the image file
        image: PathBuf,

        /// Symbol names to resolve
        names: Vec<String>,

        #[arg(long, default_value = "x86_64")]
        arch: Architecture,

        /// Slide added to every resolved value
        #[arg(long, default_value_t = 0)]
        slide: u64,
    },
    /// Compile a patch set and print its page groups and fingerprints
    Compile {
        /// Patch set JSON file
        #[arg(short, long)]
        config: PathBuf,

        /// Emit machine-readable JSON instead of a report
        #[arg(long)]
        json: bool,
    },
    /// Apply a patch set to a copy of one module file
    Apply {
        /// Patch set JSON file
        #[arg(short, long)]
        config: PathBuf,

        /// Module path (as referenced in the patch set)
        #[arg(short, long)]
        module: PathBuf,

        /// Where to write the patched copy
        #[arg(short, long)]
        output: PathBuf,

        /// Revert patches instead of applying them
        #[arg(long)]
        reverse: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("repave=info".parse()?))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Inspect { image, arch } => commands::inspect::run(&image, arch),
        Command::Symbols {
            image,
            names,
            arch,
            slide,
        } => commands::symbols::run(&image, &names, arch, slide),
        Command::Compile { config, json } => commands::compile::run(&config, json),
        Command::Apply {
            config,
            module,
            output,
            reverse,
        } => commands::apply::run(&config, &module, &output, reverse),
    }
}
