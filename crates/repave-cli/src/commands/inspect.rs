//! Inspect command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use repave_core::{Architecture, FileSource, classify, image_uuid, scan_header};

/// Run the inspect command
pub fn run(image: &Path, arch: Architecture) -> Result<()> {
    let source = FileSource::new(image);
    let classified = classify(&source, arch, None)
        .with_context(|| format!("cannot classify {}", image.display()))?;

    println!("{}", image.display().bold());
    println!("  architecture:   {arch}");
    println!("  slice offset:   0x{:X}", classified.slice_offset);

    match image_uuid(&classified.probe) {
        Some(uuid) => {
            let hex: String = uuid.iter().map(|b| format!("{b:02X}")).collect();
            println!("  uuid:           {hex}");
        }
        None => println!("  uuid:           {}", "absent".dimmed()),
    }

    let layout = scan_header(&classified.probe)?;
    println!("  text vmaddr:    0x{:X}", layout.linked_text_addr);
    println!(
        "  linkedit:       0x{:X} (+0x{:X})",
        layout.linkedit_fileoff, layout.linkedit_size
    );
    if layout.has_symbols() {
        println!(
            "  symbols:        {} entries at 0x{:X}, strings at 0x{:X}",
            layout.symbol_count, layout.symbol_fileoff, layout.string_fileoff
        );
    } else {
        println!("  symbols:        {}", "not present".dimmed());
    }

    Ok(())
}
