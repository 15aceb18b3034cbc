//! Apply command implementation.
//!
//! Offline counterpart of live patching: rewrites a copy of a module file
//! using the same match semantics, including the skip/count directives and
//! the forward/reverse direction.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use repave_core::{find_section_bounds, format_bytes, load_patch_set};

/// Run the apply command
pub fn run(config: &Path, module: &Path, output: &Path, reverse: bool) -> Result<()> {
    let set = load_patch_set(config)
        .with_context(|| format!("cannot load patch set {}", config.display()))?;

    let module_path = module.to_string_lossy();
    let Some(spec) = set.modules.iter().find(|m| m.path == module_path) else {
        bail!("module {} is not referenced by the patch set", module.display());
    };

    let mut data =
        fs::read(module).with_context(|| format!("cannot read {}", module.display()))?;

    let mut total = 0usize;
    for (index, patch) in spec.patches.iter().enumerate() {
        let find = patch.find_bytes()?;
        let replace = patch.replace_bytes()?;
        if find.len() != replace.len() {
            bail!("patch {index}: find and replace lengths differ");
        }
        let (before, after) = if reverse {
            (&replace, &find)
        } else {
            (&find, &replace)
        };

        let Some(bounds) = find_section_bounds(
            &data,
            patch.arch,
            patch.segment.segment_name(),
            patch.segment.section_name(),
        ) else {
            println!(
                "patch {index}: no {} {} section for {}, skipped",
                patch.segment.segment_name(),
                patch.segment.section_name(),
                patch.arch
            );
            continue;
        };

        let start = bounds.file_offset as usize;
        let end = start + bounds.size as usize;
        if end > data.len() {
            bail!("patch {index}: section range exceeds the file");
        }

        let mut applied = 0usize;
        let mut skip = patch.skip;
        let mut remaining = patch.count;
        let mut pos = start;
        while remaining > 0 && pos + before.len() <= end {
            if data[pos..pos + before.len()] != before[..] {
                pos += 1;
                continue;
            }
            if skip > 0 {
                skip -= 1;
                pos += 1;
                continue;
            }
            data[pos..pos + after.len()].copy_from_slice(after);
            applied += 1;
            remaining -= 1;
            pos += 1;
        }

        println!(
            "patch {index}: {} -> {} applied {applied} time(s)",
            format_bytes(before),
            format_bytes(after)
        );
        total += applied;
    }

    fs::write(output, &data).with_context(|| format!("cannot write {}", output.display()))?;
    println!("wrote {} ({total} site(s) changed)", output.display());
    Ok(())
}
