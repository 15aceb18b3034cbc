//! Compiles declarative patch sets against on-disk reference images.
//!
//! Each match is recorded twice: by its offset inside the containing 4KiB
//! page (for live page matching) and by its offset inside the containing
//! segment (for slide-aware shared-region retargeting). Matches sharing a
//! page are grouped, and groups are keyed by page content, not address:
//! identical bytes mapped at different addresses are the same logical page.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;
use crate::image::find_section_bounds;
use crate::platform::FileRead;

use super::spec::{Architecture, ModuleSpec, SegmentClass};
use super::PAGE_SIZE;

/// A patch with its byte patterns parsed and validated.
#[derive(Debug, Clone)]
pub struct CompiledPatch {
    pub arch: Architecture,
    pub segment: SegmentClass,
    pub find: Vec<u8>,
    pub replace: Vec<u8>,
    pub skip: usize,
    pub count: usize,
}

impl CompiledPatch {
    fn from_spec(spec: &super::spec::PatchSpec) -> Result<Self> {
        let find = spec.find_bytes()?;
        let replace = spec.replace_bytes()?;
        if find.len() != replace.len() {
            return Err(crate::error::Error::InvalidPatch(format!(
                "find is {} bytes but replace is {}",
                find.len(),
                replace.len()
            )));
        }
        Ok(Self {
            arch: spec.arch,
            segment: spec.segment,
            find,
            replace,
            skip: spec.skip,
            count: spec.count,
        })
    }

    pub fn size(&self) -> usize {
        self.find.len()
    }
}

/// Runtime segment mapping of a module inside a shared region, filled in
/// from the shared-cache map when available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleBounds {
    pub text_start: u64,
    pub text_end: u64,
    pub data_start: u64,
    pub data_end: u64,
}

impl ModuleBounds {
    /// Mapping range for a segment class; `None` when the class's mapping
    /// was never resolved.
    pub fn range_for(&self, segment: SegmentClass) -> Option<(u64, u64)> {
        let (start, end) = if segment.is_text() {
            (self.text_start, self.text_end)
        } else {
            (self.data_start, self.data_end)
        };
        (start != 0 && end != 0).then_some((start, end))
    }
}

#[derive(Debug)]
pub struct CompiledModule {
    pub path: String,
    pub patches: Vec<CompiledPatch>,
    pub bounds: ModuleBounds,
}

/// All matches of one patch inside one page group. Several nearby matches
/// of the same patch extend the offset lists instead of creating new
/// occurrences.
#[derive(Debug, Clone)]
pub struct PatchOccurrence {
    pub patch_index: usize,
    /// Offsets of each match from the start of the containing page
    pub page_offsets: Vec<u64>,
    /// Offsets of each match from the start of the containing segment
    pub segment_offsets: Vec<u64>,
}

/// Snapshot of one distinct target page and the occurrences inside it.
#[derive(Debug)]
pub struct PageGroup {
    pub module_index: usize,
    pub page: Vec<u8>,
    pub occurrences: Vec<PatchOccurrence>,
}

/// Output of compilation: per-module patch lists plus the page groups the
/// fingerprint table is built from.
#[derive(Debug, Default)]
pub struct PatchTable {
    pub modules: Vec<CompiledModule>,
    pub groups: Vec<PageGroup>,
}

impl PatchTable {
    pub fn occurrence_count(&self) -> usize {
        self.groups.iter().map(|g| g.occurrences.len()).sum()
    }
}

/// Compile every module's patches against its on-disk image.
///
/// A module whose file or section cannot be located is skipped with a
/// diagnostic; malformed patch definitions are configuration errors and
/// fail compilation outright.
pub fn compile_modules<F: FileRead>(specs: &[ModuleSpec], files: &F) -> Result<PatchTable> {
    let mut table = PatchTable::default();

    for (module_index, spec) in specs.iter().enumerate() {
        let patches: Vec<CompiledPatch> = spec
            .patches
            .iter()
            .map(CompiledPatch::from_spec)
            .collect::<Result<_>>()?;

        debug!(path = %spec.path, patches = patches.len(), "compiling module");

        match files.read(Path::new(&spec.path)) {
            Ok(data) => {
                for (patch_index, patch) in patches.iter().enumerate() {
                    compile_patch(&mut table, module_index, patch_index, patch, &data);
                }
            }
            Err(e) => {
                warn!(path = %spec.path, error = %e, "module unreadable, skipping its patches");
            }
        }

        table.modules.push(CompiledModule {
            path: spec.path.clone(),
            patches,
            bounds: ModuleBounds::default(),
        });
    }

    debug!(
        groups = table.groups.len(),
        occurrences = table.occurrence_count(),
        "patch compilation finished"
    );
    Ok(table)
}

fn compile_patch(
    table: &mut PatchTable,
    module_index: usize,
    patch_index: usize,
    patch: &CompiledPatch,
    data: &[u8],
) {
    let Some(bounds) = find_section_bounds(
        data,
        patch.arch,
        patch.segment.segment_name(),
        patch.segment.section_name(),
    ) else {
        warn!(
            segment = %patch.segment,
            arch = %patch.arch,
            "no such section in module, skipping patch"
        );
        return;
    };

    let start = bounds.file_offset as usize;
    let Some(section) = start
        .checked_add(bounds.size as usize)
        .filter(|&end| end <= data.len())
        .map(|end| &data[start..end])
    else {
        warn!(
            file_offset = bounds.file_offset,
            size = bounds.size,
            "section range exceeds file, skipping patch"
        );
        return;
    };

    let size = patch.size();
    if size == 0 || section.len() < size {
        return;
    }

    let mut skip = patch.skip;
    let mut remaining = patch.count;
    let mut pos = 0usize;

    while remaining > 0 && pos + size <= section.len() {
        let window = &section[pos..=section.len() - size];
        let Some(found) = memchr::memchr(patch.find[0], window) else {
            break;
        };
        let at = pos + found;
        pos = at + 1;
        if section[at..at + size] != patch.find[..] {
            continue;
        }

        if skip > 0 {
            skip -= 1;
            continue;
        }
        remaining -= 1;

        record_occurrence(table, module_index, patch_index, patch, data, &bounds, at as u64);
    }
}

fn record_occurrence(
    table: &mut PatchTable,
    module_index: usize,
    patch_index: usize,
    patch: &CompiledPatch,
    data: &[u8],
    bounds: &crate::image::SectionBounds,
    section_offset: u64,
) {
    let page_mask = !(PAGE_SIZE as u64 - 1);
    let page_addr = (bounds.section_addr + section_offset) & page_mask;
    // The page can begin before the section; its bytes still live in the file
    let page_delta = page_addr as i64 - bounds.section_addr as i64;
    let page_file_start = bounds.file_offset as i64 + page_delta;

    if page_file_start < 0 || page_file_start as usize + PAGE_SIZE > data.len() {
        warn!(
            page_addr = format_args!("{page_addr:#x}"),
            "captured page would fall outside the file, skipping occurrence"
        );
        return;
    }

    let page = &data[page_file_start as usize..page_file_start as usize + PAGE_SIZE];
    let page_offset = (section_offset as i64 - page_delta) as u64;
    let segment_offset = bounds.section_addr - bounds.segment_addr + section_offset;

    debug!(
        patch_index,
        page_offset = format_args!("{page_offset:#x}"),
        segment_offset = format_args!("{segment_offset:#x}"),
        find = %super::spec::format_bytes(&patch.find),
        "recorded patch occurrence"
    );

    // Group by page content, not by address
    let group_index = table
        .groups
        .iter()
        .position(|g| g.module_index == module_index && g.page == page)
        .unwrap_or_else(|| {
            table.groups.push(PageGroup {
                module_index,
                page: page.to_vec(),
                occurrences: Vec::new(),
            });
            table.groups.len() - 1
        });

    let group = &mut table.groups[group_index];
    let occurrence = match group
        .occurrences
        .iter_mut()
        .find(|occ| occ.patch_index == patch_index)
    {
        Some(existing) => existing,
        None => {
            group.occurrences.push(PatchOccurrence {
                patch_index,
                page_offsets: Vec::new(),
                segment_offsets: Vec::new(),
            });
            group.occurrences.last_mut().unwrap()
        }
    };

    occurrence.page_offsets.push(page_offset);
    occurrence.segment_offsets.push(segment_offset);
}
