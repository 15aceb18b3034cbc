//! Patching code mapped once and shared by many processes.
//!
//! Occurrence addresses are recomputed per process as module segment base
//! plus segment-relative offset plus the observed slide. A write only
//! happens when the current bytes equal the expected "before" image for
//! the requested direction; anything else means the page already holds the
//! desired state or an unrelated version, and the occurrence is skipped.

use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::patch::{Architecture, ModuleBounds, PAGE_SIZE, PatchTable};
use crate::platform::{Protection, TaskMemory};

use super::page::ApplyOutcome;

/// The slide observed the first time a shared region is patched. Later
/// invocations (one per consumer process) reuse it; the first write wins.
#[derive(Debug, Default)]
pub struct SharedSlide {
    cell: OnceLock<u64>,
}

impl SharedSlide {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `slide` unless one is already held; returns the stored value.
    pub fn store_first(&self, slide: u64) -> u64 {
        *self.cell.get_or_init(|| slide)
    }

    pub fn get(&self) -> Option<u64> {
        self.cell.get().copied()
    }
}

/// Apply (or revert, with `forward` false) every matching occurrence
/// inside a task's shared-region mapping.
pub fn apply_to_shared_region<T: TaskMemory>(
    task: &mut T,
    table: &PatchTable,
    slide: u64,
    arch: Architecture,
    forward: bool,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let page_mask = !(PAGE_SIZE as u64 - 1);

    for group in &table.groups {
        let module = &table.modules[group.module_index];
        for occurrence in &group.occurrences {
            let Some(patch) = module.patches.get(occurrence.patch_index) else {
                continue;
            };
            if patch.arch != arch {
                continue;
            }
            let Some((start, _end)) = module.bounds.range_for(patch.segment) else {
                continue;
            };

            debug!(path = %module.path, start = format_args!("{start:#x}"), "patching module in shared region");

            let (before, after) = if forward {
                (&patch.find, &patch.replace)
            } else {
                (&patch.replace, &patch.find)
            };

            for &seg_offset in &occurrence.segment_offsets {
                let place = start + seg_offset + slide;
                let mut current = vec![0u8; patch.size()];
                if let Err(e) = task.read(place, &mut current) {
                    warn!(address = format_args!("{place:#x}"), error = %e, "unreadable patch site");
                    outcome.failed += 1;
                    continue;
                }

                if current != *before {
                    // Already in the desired state or an unrelated build
                    if let Some(at) = current.iter().zip(before.iter()).position(|(a, b)| a != b) {
                        debug!(
                            address = format_args!("{place:#x}"),
                            at,
                            have = current[at],
                            want = before[at],
                            "bytes differ from expected state, skipping"
                        );
                    }
                    continue;
                }

                let page = place & page_mask;
                if let Err(e) = task.set_protection(
                    page,
                    PAGE_SIZE as u64,
                    Protection::READ_WRITE_EXECUTE,
                ) {
                    warn!(error = %e, "failed to obtain write permission");
                    outcome.failed += 1;
                    continue;
                }

                match task.write(place, after) {
                    Ok(()) => {
                        debug!(address = format_args!("{place:#x}"), forward, "patched shared page");
                        outcome.applied += 1;
                    }
                    Err(e) => {
                        warn!(address = format_args!("{place:#x}"), error = %e, "shared write failed");
                        outcome.failed += 1;
                    }
                }

                if let Err(e) =
                    task.set_protection(page, PAGE_SIZE as u64, Protection::READ_EXECUTE)
                {
                    warn!(error = %e, "failed to restore page protection");
                }
            }
        }
    }

    outcome
}

/// Parse a shared-region map: module path lines followed by
/// `__TEXT addr -> addr` and `__DATA addr -> addr` range lines. Returns
/// one bounds record per requested path, zeroed when unmapped.
pub fn parse_map_addresses(map: &str, paths: &[&str]) -> Vec<ModuleBounds> {
    let mut bounds = vec![ModuleBounds::default(); paths.len()];
    let mut current: Option<usize> = None;

    for line in map.lines() {
        let trimmed = line.trim();
        if let Some(index) = paths.iter().position(|p| trimmed == *p) {
            current = Some(index);
            continue;
        }

        let Some(index) = current else { continue };
        if let Some(rest) = trimmed.strip_prefix("__TEXT") {
            if let Some((start, end)) = parse_range(rest) {
                bounds[index].text_start = start;
                bounds[index].text_end = end;
            }
        } else if let Some(rest) = trimmed.strip_prefix("__DATA") {
            if let Some((start, end)) = parse_range(rest) {
                bounds[index].data_start = start;
                bounds[index].data_end = end;
            }
        }
    }

    bounds
}

fn parse_range(rest: &str) -> Option<(u64, u64)> {
    let (start, end) = rest.split_once("->")?;
    Some((parse_hex(start.trim())?, parse_hex(end.trim())?))
}

fn parse_hex(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).ok()
}
