//! Symbols command implementation.

use std::path::Path;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use repave_core::{Architecture, FileSource, KernelImage};

/// Run the symbols command
pub fn run(image: &Path, names: &[String], arch: Architecture, slide: u64) -> Result<()> {
    if names.is_empty() {
        bail!("no symbol names given");
    }

    let source = FileSource::new(image);
    let mut kernel_image = KernelImage::parse(&source, arch, None)
        .with_context(|| format!("cannot load {}", image.display()))?;
    kernel_image.set_slide(slide, 0);

    let mut missing = 0usize;
    for name in names {
        match kernel_image.resolve(name) {
            Ok(address) => println!("{name:<40} 0x{address:X}"),
            Err(_) => {
                println!("{name:<40} {}", "not found".red());
                missing += 1;
            }
        }
    }

    if missing > 0 {
        bail!("{missing} symbol(s) not found");
    }
    Ok(())
}
