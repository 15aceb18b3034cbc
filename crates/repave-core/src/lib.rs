//! # repave-core
//!
//! Core library for the repave live binary-patching engine.
//!
//! This crate provides:
//! - Executable image parsing: thin, fat and compressed header
//!   classification, segment/section lookup, symbol resolution and load
//!   slide computation, using only the loaded binary's own layout
//! - Compilation of declarative byte patches against on-disk images into
//!   page groups with page- and segment-relative offsets
//! - Page fingerprinting, identifying registered target pages at
//!   validation time without full content comparisons per candidate
//! - Transactional live patching: in-place page edits, slide-aware
//!   shared-region patching, and restrict-segment header injection
//!
//! Everything privileged sits behind the narrow traits in [`platform`],
//! so the matching logic runs unchanged against synthetic memory.
//!
//! ## Feature Flags
//!
//! - `debug-tools`: extra inspection helpers for the CLI; not intended
//!   for embedding.

#[cfg(feature = "debug-tools")]
pub mod debug;
pub mod engine;
pub mod error;
pub mod hook;
pub mod image;
pub mod kernel;
pub mod live;
pub mod patch;
pub mod platform;

pub use engine::{CallbackTargets, EngineConfig, EngineConfigBuilder, Repave};
pub use error::{Error, Result};
pub use hook::{Hook, Hooking};
pub use image::{ClassifiedImage, ImageLayout, SectionBounds, classify, find_section_bounds,
    image_uuid, scan_header};
pub use kernel::{KernelImage, WriteGuard, find_base};
pub use live::{
    ApplyOutcome, SharedSlide, apply_to_page, apply_to_shared_region, inject_restrict,
    parse_map_addresses,
};
pub use patch::{
    Architecture, CompiledModule, CompiledPatch, Fingerprint, ModuleBounds, ModuleSpec,
    PAGE_SIZE, PageGroup, PatchOccurrence, PatchSet, PatchSpec, PatchTable, ProcessSpec,
    SegmentClass, build_fingerprint, compile_modules, format_bytes, load_patch_set, parse_bytes,
    read_sample, save_patch_set,
};
pub use platform::{
    Decompress, FileRead, FileSource, Filesystem, ImageSource, KernelSpace, Protection,
    TaskMemory,
};

// Debug utilities (requires debug-tools feature)
#[cfg(feature = "debug-tools")]
pub use debug::{CompileReport, DiscriminatorReport, GroupReport, ModuleReport, OccurrenceReport};
