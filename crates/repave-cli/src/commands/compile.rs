//! Compile command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use repave_core::{
    CompileReport, Filesystem, build_fingerprint, compile_modules, format_bytes, load_patch_set,
    read_sample,
};

/// Run the compile command
pub fn run(config: &Path, json: bool) -> Result<()> {
    let set = load_patch_set(config)
        .with_context(|| format!("cannot load patch set {}", config.display()))?;
    let table = compile_modules(&set.modules, &Filesystem)?;
    let fingerprint = build_fingerprint(&table.groups);

    if json {
        let report = CompileReport::new(&table, &fingerprint);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for module in &table.modules {
        println!("{}", module.path.bold());
        for (i, patch) in module.patches.iter().enumerate() {
            println!(
                "  [{i}] {} {}: {} -> {} (skip {}, count {})",
                patch.arch,
                patch.segment,
                format_bytes(&patch.find),
                format_bytes(&patch.replace),
                patch.skip,
                patch.count
            );
        }
    }

    println!();
    println!("{} page group(s)", table.groups.len());
    for (g, group) in table.groups.iter().enumerate() {
        let module = &table.modules[group.module_index];
        println!("  group {g} in {}", module.path);
        for occ in &group.occurrences {
            let pages: Vec<String> =
                occ.page_offsets.iter().map(|o| format!("0x{o:X}")).collect();
            println!(
                "    patch {} at page offsets [{}] ({} site(s))",
                occ.patch_index,
                pages.join(", "),
                occ.segment_offsets.len()
            );
        }
    }

    println!();
    println!("discriminator offsets:");
    for (i, &offset) in fingerprint.offsets.iter().enumerate() {
        let samples: Vec<String> = table
            .groups
            .iter()
            .map(|g| format!("0x{:016X}", read_sample(&g.page, offset)))
            .collect();
        println!("  [{i}] 0x{offset:X}: {}", samples.join(" "));
    }

    Ok(())
}
