//! In-place patching of a page that just passed code validation.

use tracing::{debug, warn};

use crate::kernel::WriteGuard;
use crate::patch::{CompiledModule, PageGroup};
use crate::platform::KernelSpace;

/// Per-group application result; failures are aggregated, not fatal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub failed: usize,
}

impl ApplyOutcome {
    pub fn absorb(&mut self, other: ApplyOutcome) {
        self.applied += other.applied;
        self.failed += other.failed;
    }
}

/// Apply every occurrence of `group` to the live page bytes.
///
/// Write protection is lowered around each occurrence and restored
/// afterward; a failed occurrence is counted and the rest still run.
pub fn apply_to_page<K: KernelSpace>(
    kernel: &K,
    guard: &mut WriteGuard,
    page: &mut [u8],
    group: &PageGroup,
    module: &CompiledModule,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    for occurrence in &group.occurrences {
        let Some(patch) = module.patches.get(occurrence.patch_index) else {
            warn!(index = occurrence.patch_index, "occurrence references unknown patch");
            outcome.failed += occurrence.page_offsets.len();
            continue;
        };
        if occurrence.page_offsets.is_empty() {
            continue;
        }

        if let Err(e) = guard.set(kernel, true, false) {
            warn!(error = %e, "could not obtain write permission, skipping occurrence");
            outcome.failed += occurrence.page_offsets.len();
            continue;
        }

        for &offset in &occurrence.page_offsets {
            let offset = offset as usize;
            if offset + patch.size() > page.len() {
                warn!(offset, size = patch.size(), "patch would leave the page");
                outcome.failed += 1;
                continue;
            }
            write_patch(page, offset, &patch.replace);
            outcome.applied += 1;
        }

        if guard.set(kernel, false, false).is_err() {
            warn!("failed to restore write protection");
        }

        debug!(
            patch = occurrence.patch_index,
            offsets = occurrence.page_offsets.len(),
            "applied page occurrence"
        );
    }

    outcome
}

/// The canonical sizes go down as single stores so concurrently executing
/// code never observes a half-written instruction; anything else is a
/// byte-range copy.
fn write_patch(page: &mut [u8], offset: usize, data: &[u8]) {
    unsafe {
        let dst = page.as_mut_ptr().add(offset);
        match data.len() {
            1 => *dst = data[0],
            2 => (dst as *mut u16).write_unaligned(u16::from_le_bytes(data.try_into().unwrap())),
            4 => (dst as *mut u32).write_unaligned(u32::from_le_bytes(data.try_into().unwrap())),
            8 => (dst as *mut u64).write_unaligned(u64::from_le_bytes(data.try_into().unwrap())),
            _ => std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{
        Architecture, CompiledModule, ModuleBounds, PAGE_SIZE, PatchOccurrence, SegmentClass,
    };
    use crate::platform::MockKernel;

    fn module(find: Vec<u8>, replace: Vec<u8>) -> CompiledModule {
        CompiledModule {
            path: "/mod/sample".to_string(),
            patches: vec![crate::patch::CompiledPatch {
                arch: Architecture::X86_64,
                segment: SegmentClass::Text,
                find,
                replace,
                skip: 0,
                count: 1,
            }],
            bounds: ModuleBounds::default(),
        }
    }

    fn group_with_offsets(page: Vec<u8>, offsets: Vec<u64>) -> PageGroup {
        PageGroup {
            module_index: 0,
            page,
            occurrences: vec![PatchOccurrence {
                patch_index: 0,
                page_offsets: offsets,
                segment_offsets: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_apply_writes_all_occurrence_offsets() {
        let kernel = MockKernel::new(0, vec![]);
        let mut guard = WriteGuard::new();
        let module = module(vec![0x74, 0x02], vec![0xEB, 0x02]);

        let mut page = vec![0x90u8; PAGE_SIZE];
        page[0x10] = 0x74;
        page[0x11] = 0x02;
        page[0x30] = 0x74;
        page[0x31] = 0x02;
        let group = group_with_offsets(page.clone(), vec![0x10, 0x30]);

        let outcome = apply_to_page(&kernel, &mut guard, &mut page, &group, &module);
        assert_eq!(outcome, ApplyOutcome { applied: 2, failed: 0 });
        assert_eq!(&page[0x10..0x12], &[0xEB, 0x02]);
        assert_eq!(&page[0x30..0x32], &[0xEB, 0x02]);
        // Protection closed again afterward
        assert!(kernel.write_protected());
        assert!(kernel.interrupts_on());
    }

    #[test]
    fn test_apply_with_odd_size_copies_range() {
        let kernel = MockKernel::new(0, vec![]);
        let mut guard = WriteGuard::new();
        let module = module(vec![1, 2, 3], vec![7, 8, 9]);

        let mut page = vec![0u8; PAGE_SIZE];
        let group = group_with_offsets(page.clone(), vec![0x100]);
        let outcome = apply_to_page(&kernel, &mut guard, &mut page, &group, &module);
        assert_eq!(outcome.applied, 1);
        assert_eq!(&page[0x100..0x103], &[7, 8, 9]);
    }

    #[test]
    fn test_protection_failure_skips_occurrence_only() {
        let kernel = MockKernel::new(0, vec![]);
        kernel.fail_wp_change.set(true);
        let mut guard = WriteGuard::new();
        let module = module(vec![0x74], vec![0xEB]);

        let mut page = vec![0x74u8; PAGE_SIZE];
        let group = group_with_offsets(page.clone(), vec![0x0, 0x1]);
        let outcome = apply_to_page(&kernel, &mut guard, &mut page, &group, &module);
        assert_eq!(outcome, ApplyOutcome { applied: 0, failed: 2 });
        assert_eq!(page[0], 0x74);
    }

    #[test]
    fn test_out_of_page_offset_is_counted_failed() {
        let kernel = MockKernel::new(0, vec![]);
        let mut guard = WriteGuard::new();
        let module = module(vec![0x74, 0x02], vec![0xEB, 0x02]);

        let mut page = vec![0u8; PAGE_SIZE];
        let group = group_with_offsets(page.clone(), vec![(PAGE_SIZE - 1) as u64]);
        let outcome = apply_to_page(&kernel, &mut guard, &mut page, &group, &module);
        assert_eq!(outcome, ApplyOutcome { applied: 0, failed: 1 });
    }
}
