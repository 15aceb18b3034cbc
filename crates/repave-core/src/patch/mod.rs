//! Declarative byte-patch definitions and their compiled form.

mod compiler;
mod fingerprint;
mod spec;

pub use compiler::{
    CompiledModule, CompiledPatch, ModuleBounds, PageGroup, PatchOccurrence, PatchTable,
    compile_modules,
};
pub use fingerprint::{Fingerprint, build_fingerprint, read_sample};
pub use spec::{
    Architecture, ModuleSpec, PatchSet, PatchSpec, ProcessSpec, SegmentClass, format_bytes,
    load_patch_set, parse_bytes, save_patch_set,
};

/// Granularity of page capture, fingerprinting and protection toggling.
pub const PAGE_SIZE: usize = 4096;
