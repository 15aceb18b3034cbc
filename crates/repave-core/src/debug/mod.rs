//! Diagnostic views over compiled patch state, for CLI tools and
//! development rather than embedding.

use serde::Serialize;

use crate::patch::{Fingerprint, PatchTable, read_sample};

/// Machine-readable compilation summary, with addresses and samples
/// rendered as hex strings.
#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub modules: Vec<ModuleReport>,
    pub groups: Vec<GroupReport>,
    pub discriminators: Vec<DiscriminatorReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleReport {
    pub path: String,
    pub patches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub module: String,
    pub occurrences: Vec<OccurrenceReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OccurrenceReport {
    pub patch_index: usize,
    pub page_offsets: Vec<String>,
    pub segment_offsets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscriminatorReport {
    pub offset: String,
    /// One sample per registered group at this offset
    pub samples: Vec<String>,
}

impl CompileReport {
    pub fn new(table: &PatchTable, fingerprint: &Fingerprint) -> Self {
        Self {
            modules: table
                .modules
                .iter()
                .map(|m| ModuleReport {
                    path: m.path.clone(),
                    patches: m.patches.len(),
                })
                .collect(),
            groups: table
                .groups
                .iter()
                .map(|g| GroupReport {
                    module: table.modules[g.module_index].path.clone(),
                    occurrences: g
                        .occurrences
                        .iter()
                        .map(|o| OccurrenceReport {
                            patch_index: o.patch_index,
                            page_offsets: hex_list(&o.page_offsets),
                            segment_offsets: hex_list(&o.segment_offsets),
                        })
                        .collect(),
                })
                .collect(),
            discriminators: fingerprint
                .offsets
                .iter()
                .enumerate()
                .map(|(i, &offset)| DiscriminatorReport {
                    offset: format!("0x{offset:X}"),
                    samples: table
                        .groups
                        .iter()
                        .map(|g| format!("0x{:016X}", read_sample(&g.page, offset)))
                        .collect(),
                })
                .collect(),
        }
    }
}

fn hex_list(values: &[u64]) -> Vec<String> {
    values.iter().map(|v| format!("0x{v:X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{build_fingerprint, PAGE_SIZE, PageGroup, PatchOccurrence, PatchTable};

    #[test]
    fn test_report_renders_hex() {
        let mut table = PatchTable::default();
        table.modules.push(crate::patch::CompiledModule {
            path: "/mod/sample".to_string(),
            patches: Vec::new(),
            bounds: Default::default(),
        });
        table.groups.push(PageGroup {
            module_index: 0,
            page: vec![0u8; PAGE_SIZE],
            occurrences: vec![PatchOccurrence {
                patch_index: 0,
                page_offsets: vec![0x40],
                segment_offsets: vec![0x1040],
            }],
        });
        let fingerprint = build_fingerprint(&table.groups);

        let report = CompileReport::new(&table, &fingerprint);
        assert_eq!(report.groups[0].occurrences[0].page_offsets, vec!["0x40"]);
        assert_eq!(report.groups[0].occurrences[0].segment_offsets, vec!["0x1040"]);
        assert_eq!(report.discriminators.len(), 1);
    }
}
