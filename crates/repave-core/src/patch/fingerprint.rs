//! Page fingerprinting: recognize which registered page a live page is
//! without comparing it against every candidate in full.
//!
//! The table holds one learned byte offset per registered group (after the
//! first), each with the 8-byte value every group exhibits there. Matching
//! samples offsets in order, narrowing the candidate set; a final
//! full-page comparison confirms the survivor, so a page matching none of
//! the groups can never be patched.

use tracing::debug;

use super::PAGE_SIZE;
use super::compiler::PageGroup;

const SAMPLE_SIZE: usize = 8;

#[derive(Debug, Default)]
pub struct Fingerprint {
    /// Discriminator offsets, in learning order
    pub offsets: Vec<usize>,
    /// `samples[i][g]` is group `g`'s value at `offsets[i]`
    pub samples: Vec<Vec<u64>>,
}

/// 8-byte little-endian sample at `offset`; caller keeps the offset inside
/// the page.
pub fn read_sample(page: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(page[offset..offset + SAMPLE_SIZE].try_into().unwrap())
}

fn sample_all(groups: &[PageGroup], offset: usize) -> Vec<u64> {
    groups.iter().map(|g| read_sample(&g.page, offset)).collect()
}

fn all_distinct(values: &[u64]) -> bool {
    values
        .iter()
        .enumerate()
        .all(|(i, v)| values[i + 1..].iter().all(|w| w != v))
}

fn distinct_count(values: &[u64]) -> usize {
    let mut seen: Vec<u64> = Vec::with_capacity(values.len());
    for &v in values {
        if !seen.contains(&v) {
            seen.push(v);
        }
    }
    seen.len()
}

/// Build the discriminator table for the registered groups, in
/// registration order.
pub fn build_fingerprint(groups: &[PageGroup]) -> Fingerprint {
    let mut fingerprint = Fingerprint::default();
    if groups.is_empty() {
        return fingerprint;
    }

    // First offset: the earliest aligned position where every group
    // disagrees with every other. If the page runs out, the least
    // ambiguous position found is kept; later offsets keep narrowing.
    let mut first = 0;
    let mut best_distinct = 0;
    let mut offset = 0;
    let mut found = false;
    while offset + SAMPLE_SIZE <= PAGE_SIZE {
        let values = sample_all(groups, offset);
        if all_distinct(&values) {
            debug!(offset = format_args!("{offset:#x}"), "fully discriminating offset");
            first = offset;
            found = true;
            break;
        }
        let distinct = distinct_count(&values);
        if distinct > best_distinct {
            best_distinct = distinct;
            first = offset;
        }
        offset += SAMPLE_SIZE;
    }
    if !found {
        debug!(
            offset = format_args!("{first:#x}"),
            distinct = best_distinct,
            "no fully discriminating offset, keeping best available"
        );
    }

    fingerprint.offsets.push(first);
    fingerprint.samples.push(sample_all(groups, first));

    // Subsequent offsets resume after the previous choice, wrap once at
    // the end of the page and never reuse the first offset.
    let mut cursor = first + SAMPLE_SIZE;
    for _ in 1..groups.len() {
        if cursor + SAMPLE_SIZE > PAGE_SIZE {
            cursor = 0;
        }
        if cursor == first {
            cursor += SAMPLE_SIZE;
            if cursor + SAMPLE_SIZE > PAGE_SIZE {
                cursor = 0;
            }
        }
        fingerprint.offsets.push(cursor);
        fingerprint.samples.push(sample_all(groups, cursor));
        cursor += SAMPLE_SIZE;
    }

    fingerprint
}

impl Fingerprint {
    /// Identify which registered group `page` is, if any.
    ///
    /// Candidates are narrowed one discriminator at a time; whatever
    /// survives must still pass a full content comparison, so an
    /// unregistered page never yields a match.
    pub fn match_page(&self, page: &[u8], groups: &[PageGroup]) -> Option<usize> {
        if self.offsets.is_empty() || page.len() < PAGE_SIZE {
            return None;
        }

        let value = read_sample(page, self.offsets[0]);
        let mut candidates: Vec<usize> = (0..groups.len())
            .filter(|&g| self.samples[0][g] == value)
            .collect();

        let mut index = 1;
        while candidates.len() > 1 && index < self.offsets.len() {
            let value = read_sample(page, self.offsets[index]);
            candidates.retain(|&g| self.samples[index][g] == value);
            index += 1;
        }

        candidates
            .into_iter()
            .find(|&g| groups[g].page[..] == page[..PAGE_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_from(page: Vec<u8>) -> PageGroup {
        PageGroup {
            module_index: 0,
            page,
            occurrences: Vec::new(),
        }
    }

    /// Pages that differ in their very first quadword.
    fn distinct_head_groups(count: u8) -> Vec<PageGroup> {
        (0..count)
            .map(|i| {
                let mut page = vec![0u8; PAGE_SIZE];
                page[0] = i + 1;
                group_from(page)
            })
            .collect()
    }

    #[test]
    fn test_every_group_identifies_itself() {
        let groups = distinct_head_groups(5);
        let fingerprint = build_fingerprint(&groups);
        assert_eq!(fingerprint.offsets.len(), 5);
        assert_eq!(fingerprint.offsets[0], 0);

        for (i, group) in groups.iter().enumerate() {
            assert_eq!(fingerprint.match_page(&group.page, &groups), Some(i));
        }
    }

    #[test]
    fn test_unknown_page_never_matches() {
        let groups = distinct_head_groups(3);
        let fingerprint = build_fingerprint(&groups);

        let unknown = vec![0xEEu8; PAGE_SIZE];
        assert_eq!(fingerprint.match_page(&unknown, &groups), None);

        // Same discriminator value as group 0 but different content later:
        // survives sampling, dies on the full comparison
        let mut near_miss = groups[0].page.clone();
        near_miss[PAGE_SIZE - 1] ^= 0xFF;
        assert_eq!(fingerprint.match_page(&near_miss, &groups), None);
    }

    #[test]
    fn test_late_difference_still_discriminates() {
        // Identical pages except for one quadword deep inside
        let mut a = vec![0u8; PAGE_SIZE];
        let mut b = vec![0u8; PAGE_SIZE];
        a[0x800] = 1;
        b[0x800] = 2;
        let groups = vec![group_from(a), group_from(b)];

        let fingerprint = build_fingerprint(&groups);
        assert_eq!(fingerprint.offsets[0], 0x800);
        assert_eq!(fingerprint.match_page(&groups[0].page, &groups), Some(0));
        assert_eq!(fingerprint.match_page(&groups[1].page, &groups), Some(1));
    }

    #[test]
    fn test_no_discriminating_offset_falls_back_to_full_compare() {
        // Two identical pages: no offset can separate them, but matching
        // still confirms via full comparison against the first group
        let page = vec![0x42u8; PAGE_SIZE];
        let groups = vec![group_from(page.clone()), group_from(page.clone())];

        let fingerprint = build_fingerprint(&groups);
        assert_eq!(fingerprint.offsets.len(), 2);
        assert_eq!(fingerprint.match_page(&page, &groups), Some(0));
    }

    #[test]
    fn test_empty_table_matches_nothing() {
        let fingerprint = build_fingerprint(&[]);
        let page = vec![0u8; PAGE_SIZE];
        assert_eq!(fingerprint.match_page(&page, &[]), None);
    }
}
