//! Engine orchestration.
//!
//! Compilation and fingerprinting run once at initialization against
//! on-disk copies of the target binaries. Hooking runs once against the
//! host image. Afterward the interception callbacks classify and patch
//! live pages and processes using the precomputed tables. Callbacks reach
//! the engine through an explicit reference captured by the embedder;
//! there is no process-wide singleton.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hook::{Hook, Hooking};
use crate::kernel::{KernelImage, WriteGuard};
use crate::live::{
    ApplyOutcome, SharedSlide, apply_to_page, apply_to_shared_region, inject_restrict,
    parse_map_addresses,
};
use crate::patch::{
    Architecture, Fingerprint, ModuleBounds, PAGE_SIZE, PatchSet, PatchTable, build_fingerprint,
    compile_modules,
};
use crate::platform::{FileRead, KernelSpace, TaskMemory};

/// Default locations of the shared-region map file.
pub const SHARED_CACHE_MAP_PATHS: &[&str] = &[
    "/var/db/dyld/dyld_shared_cache_x86_64h.map",
    "/var/db/dyld/dyld_shared_cache_x86_64.map",
];

/// Interception entry points the engine hooks in the host.
const VALIDATE_RANGE: &str = "_cs_validate_range";
const VALIDATE_PAGE: &str = "_cs_validate_page";
const EXEC_SWITCH: &str = "_proc_exec_switch_task";
const REGION_MAP: &str = "_vm_shared_region_map_file";
const REGION_SLIDE: &str = "_vm_shared_region_slide";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Architecture patches are matched and applied for
    pub arch: Architecture,
    /// Allow unpacking compressed host images
    pub allow_decompress: bool,
    /// Patch the shared region once instead of every process image
    pub patch_shared_cache: bool,
    /// Candidate shared-region map locations, tried in order
    pub shared_cache_maps: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            arch: Architecture::X86_64,
            allow_decompress: true,
            patch_shared_cache: true,
            shared_cache_maps: SHARED_CACHE_MAP_PATHS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    arch: Option<Architecture>,
    allow_decompress: Option<bool>,
    patch_shared_cache: Option<bool>,
    shared_cache_maps: Option<Vec<String>>,
}

impl EngineConfigBuilder {
    pub fn arch(mut self, arch: Architecture) -> Self {
        self.arch = Some(arch);
        self
    }

    pub fn allow_decompress(mut self, allow: bool) -> Self {
        self.allow_decompress = Some(allow);
        self
    }

    pub fn patch_shared_cache(mut self, enabled: bool) -> Self {
        self.patch_shared_cache = Some(enabled);
        self
    }

    pub fn shared_cache_maps<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared_cache_maps = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> EngineConfig {
        let default = EngineConfig::default();
        EngineConfig {
            arch: self.arch.unwrap_or(default.arch),
            allow_decompress: self.allow_decompress.unwrap_or(default.allow_decompress),
            patch_shared_cache: self.patch_shared_cache.unwrap_or(default.patch_shared_cache),
            shared_cache_maps: self.shared_cache_maps.unwrap_or(default.shared_cache_maps),
        }
    }
}

/// Replacement entry addresses supplied by the embedder, one per
/// interception point.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackTargets {
    pub validate: u64,
    pub exec_switch: u64,
    pub region_map: u64,
    pub region_slide: u64,
}

/// The engine: compiled patch state plus the callbacks that apply it.
pub struct Repave {
    config: EngineConfig,
    set: PatchSet,
    table: PatchTable,
    fingerprint: Fingerprint,
    shared_slide: SharedSlide,
    guard: WriteGuard,
    hooks: Vec<Hook>,
    min_process_path: usize,
    pending_path: Option<String>,
    shared_cache_patching: bool,
    has_exec_switch: bool,
    activated: bool,
    on_binary_loaded: Option<Box<dyn Fn(&str) + Send>>,
}

impl Repave {
    pub fn new(config: EngineConfig, set: PatchSet) -> Self {
        let min_process_path = set.processes.iter().map(|p| p.path.len()).min().unwrap_or(0);
        let shared_cache_patching = config.patch_shared_cache;
        Self {
            config,
            set,
            table: PatchTable::default(),
            fingerprint: Fingerprint::default(),
            shared_slide: SharedSlide::new(),
            guard: WriteGuard::new(),
            hooks: Vec::new(),
            min_process_path,
            pending_path: None,
            shared_cache_patching,
            has_exec_switch: false,
            activated: false,
            on_binary_loaded: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn table(&self) -> &PatchTable {
        &self.table
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Invoked after a registered process image has been patched.
    pub fn set_binary_loaded_callback(&mut self, callback: Box<dyn Fn(&str) + Send>) {
        self.on_binary_loaded = Some(callback);
    }

    /// Compile all module patches against their on-disk images, resolve
    /// shared-region bounds, and build the fingerprint table.
    pub fn compile<F: FileRead>(&mut self, files: &F) -> Result<()> {
        self.table = compile_modules(&self.set.modules, files)?;

        if self.shared_cache_patching {
            self.load_shared_cache_map(files)?;
        }

        self.fingerprint = build_fingerprint(&self.table.groups);
        info!(
            modules = self.table.modules.len(),
            groups = self.table.groups.len(),
            occurrences = self.table.occurrence_count(),
            "patch tables compiled"
        );
        Ok(())
    }

    fn load_shared_cache_map<F: FileRead>(&mut self, files: &F) -> Result<()> {
        let mut content = None;
        for path in &self.config.shared_cache_maps {
            if let Ok(bytes) = files.read(Path::new(path)) {
                debug!(path, "loaded shared-region map");
                content = Some(bytes);
                break;
            }
        }

        let Some(bytes) = content else {
            warn!("no shared-region map found, falling back to per-process injection");
            self.shared_cache_patching = false;
            return Ok(());
        };

        let text = String::from_utf8_lossy(&bytes);
        let paths: Vec<&str> = self.set.modules.iter().map(|m| m.path.as_str()).collect();
        let bounds = parse_map_addresses(&text, &paths);
        let mapped = bounds.iter().filter(|b| **b != ModuleBounds::default()).count();
        if mapped == 0 {
            return Err(Error::Malformed(
                "no registered module is present in the shared-region map".into(),
            ));
        }

        debug!(mapped, total = paths.len(), "resolved shared-region bounds");
        for (module, bounds) in self.table.modules.iter_mut().zip(bounds) {
            module.bounds = bounds;
        }
        Ok(())
    }

    /// Resolve and hook the interception points. Failure of a mandatory
    /// hook disables the engine for the session.
    pub fn attach<H: Hooking>(
        &mut self,
        image: &KernelImage,
        substrate: &mut H,
        targets: &CallbackTargets,
    ) -> Result<()> {
        // Code-validation interception: range variant preferred, page
        // variant as the fallback on older hosts
        let validate = image
            .resolve(VALIDATE_RANGE)
            .or_else(|_| image.resolve(VALIDATE_PAGE))
            .map_err(|_| Error::HookFailed(VALIDATE_RANGE.into()))?;
        self.hooks.push(
            Hook::install(substrate, validate, targets.validate)
                .map_err(|_| Error::HookFailed(VALIDATE_RANGE.into()))?,
        );

        // Exec interception may be absent on older hosts; without it the
        // exec callback patches the task directly
        match image.resolve(EXEC_SWITCH) {
            Ok(addr) => {
                self.hooks.push(
                    Hook::install(substrate, addr, targets.exec_switch)
                        .map_err(|_| Error::HookFailed(EXEC_SWITCH.into()))?,
                );
                self.has_exec_switch = true;
            }
            Err(_) => debug!("exec switch entry not present, patching directly at exec"),
        }

        if self.shared_cache_patching {
            for (name, replacement) in
                [(REGION_MAP, targets.region_map), (REGION_SLIDE, targets.region_slide)]
            {
                let addr = image
                    .resolve(name)
                    .map_err(|_| Error::HookFailed(name.into()))?;
                self.hooks.push(
                    Hook::install(substrate, addr, replacement)
                        .map_err(|_| Error::HookFailed(name.into()))?,
                );
            }
        }

        info!(hooks = self.hooks.len(), "interception points attached");
        Ok(())
    }

    /// Remove every installed hook, in reverse installation order.
    pub fn detach<H: Hooking>(&mut self, substrate: &mut H) {
        while let Some(hook) = self.hooks.pop() {
            if let Err(e) = hook.uninstall(substrate) {
                warn!(error = %e, "failed to remove hook");
            }
        }
        self.activated = false;
        self.has_exec_switch = false;
    }

    /// Start reacting to exec interception.
    pub fn activate(&mut self) {
        self.activated = true;
    }

    /// Code-validation callback: classify each page of the validated
    /// region and patch the ones that match a registered group. Runs on a
    /// hot path and returns quickly on unknown pages.
    pub fn on_page_validated<K: KernelSpace>(
        &mut self,
        kernel: &K,
        region: &mut [u8],
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for page in region.chunks_exact_mut(PAGE_SIZE) {
            let Some(index) = self.fingerprint.match_page(page, &self.table.groups) else {
                continue;
            };
            debug!(group = index, "validated page matches a registered group");
            let group = &self.table.groups[index];
            let module = &self.table.modules[group.module_index];
            outcome.absorb(apply_to_page(kernel, &mut self.guard, page, group, module));
        }
        outcome
    }

    /// Exec interception callback.
    pub fn on_exec<T: TaskMemory>(&mut self, task: &mut T, path: &str) {
        if !self.activated || path.len() < self.min_process_path {
            return;
        }
        if !self.set.processes.iter().any(|p| p.path == path) {
            return;
        }

        debug!(path, "caught registered process");
        if self.has_exec_switch {
            // The new task map does not exist yet; patch when the host
            // switches tasks
            self.pending_path = Some(path.to_string());
        } else {
            self.patch_task(task, path);
        }
    }

    /// Task-switch callback, completing a deferred exec patch.
    pub fn on_exec_switch<T: TaskMemory>(&mut self, task: &mut T) {
        if let Some(path) = self.pending_path.take() {
            debug!(path, "completing deferred patch");
            self.patch_task(task, &path);
        }
    }

    /// Shared-region mapping/sliding callback. The first observed slide is
    /// retained; repeated invocations for other consumers reuse it.
    pub fn on_shared_region_slide<T: TaskMemory>(&mut self, task: &mut T, slide: u64) {
        let stored = self.shared_slide.store_first(slide);
        if stored != slide {
            debug!(stored, slide, "slide already stored, patching with the observed value");
        }
        let outcome = apply_to_shared_region(task, &self.table, slide, self.config.arch, true);
        debug!(applied = outcome.applied, failed = outcome.failed, "patched shared region");
    }

    fn patch_task<T: TaskMemory>(&mut self, task: &mut T, path: &str) {
        if self.shared_cache_patching
            && let Some(slide) = self.shared_slide.get()
        {
            let outcome =
                apply_to_shared_region(task, &self.table, slide, self.config.arch, true);
            debug!(
                path,
                applied = outcome.applied,
                failed = outcome.failed,
                "applied shared-region patches"
            );
        } else {
            if self.shared_cache_patching {
                warn!("no stored slide, falling back to restrict injection");
            }
            if let Err(e) = inject_restrict(task, task.base_address()) {
                warn!(path, error = %e, "restrict injection failed");
            }
        }

        if let Some(callback) = &self.on_binary_loaded {
            callback(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::hook::mock::MockHooking;
    use crate::image::constants::{SEG_LINKEDIT, SEG_TEXT};
    use crate::image::testing::{MachBuilder, nlist64};
    use crate::patch::{ModuleSpec, PatchSpec, ProcessSpec, SegmentClass};
    use crate::platform::{MockFiles, MockKernel, MockTask};

    const MODULE_PATH: &str = "/usr/lib/libsample.dylib";
    const PROCESS_PATH: &str = "/usr/bin/sample";
    const SECTION_ADDR: u64 = 0x1000;
    const TEXT_START: u64 = 0x7fff_2000_0000;

    fn patch_set() -> PatchSet {
        PatchSet {
            modules: vec![ModuleSpec {
                path: MODULE_PATH.to_string(),
                patches: vec![PatchSpec {
                    arch: Architecture::X86_64,
                    segment: SegmentClass::Text,
                    find: "74 02 31 C0".to_string(),
                    replace: "EB 02 31 C0".to_string(),
                    skip: 0,
                    count: 4,
                }],
            }],
            processes: vec![ProcessSpec {
                path: PROCESS_PATH.to_string(),
            }],
        }
    }

    fn module_files(match_offset: usize) -> (MockFiles, Vec<u8>) {
        let mut section = vec![0x90u8; PAGE_SIZE];
        section[match_offset..match_offset + 4].copy_from_slice(&[0x74, 0x02, 0x31, 0xC0]);
        let image = MachBuilder::new()
            .segment_with_section(
                SEG_TEXT,
                0x0,
                "__text",
                SECTION_ADDR,
                section.len() as u64,
                SECTION_ADDR as u32,
            )
            .content(SECTION_ADDR as usize, section.clone())
            .min_size(SECTION_ADDR as usize + PAGE_SIZE)
            .build();
        let mut files = MockFiles::new();
        files.insert(MODULE_PATH, image);
        (files, section)
    }

    fn host_image(symbols: &[&str]) -> KernelImage {
        let mut strings = vec![0u8];
        let mut table = Vec::new();
        for (i, name) in symbols.iter().enumerate() {
            let strx = strings.len() as u32;
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            table.extend(nlist64(strx, 0x8000 + (i as u64) * 0x100));
        }

        let disk = MachBuilder::new()
            .segment(SEG_TEXT, 0xffff_ff80_0000_0000, 0, 0x1000)
            .segment(SEG_LINKEDIT, 0xffff_ff80_0010_0000, 0x2000, 0x800)
            .symtab(0x2000, symbols.len() as u32, 0x2400)
            .content(0x2000, table)
            .content(0x2400, strings)
            .min_size(0x2800)
            .build();

        let mut image = KernelImage::from_source(
            disk.as_slice(),
            Architecture::X86_64,
            None::<&MockKernel>,
            None,
        )
        .unwrap();
        image.set_slide(0, 0);
        image
    }

    fn engine_without_shared_cache() -> Repave {
        let config = EngineConfig::builder().patch_shared_cache(false).build();
        Repave::new(config, patch_set())
    }

    #[test]
    fn test_validated_page_is_recognized_and_patched() {
        let (files, section) = module_files(0x40);
        let mut engine = engine_without_shared_cache();
        engine.compile(&files).unwrap();

        let kernel = MockKernel::new(0, vec![]);
        let mut region = section.clone();
        let outcome = engine.on_page_validated(&kernel, &mut region);
        assert_eq!(outcome, ApplyOutcome { applied: 1, failed: 0 });
        assert_eq!(&region[0x40..0x44], &[0xEB, 0x02, 0x31, 0xC0]);

        // A foreign page is left alone
        let mut foreign = vec![0xCCu8; PAGE_SIZE];
        let outcome = engine.on_page_validated(&kernel, &mut foreign);
        assert_eq!(outcome, ApplyOutcome::default());
        assert!(foreign.iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn test_exec_without_switch_injects_restrict() {
        let (files, _) = module_files(0x40);
        let mut engine = engine_without_shared_cache();
        engine.compile(&files).unwrap();
        engine.activate();

        let loaded = Arc::new(AtomicUsize::new(0));
        let seen = loaded.clone();
        engine.set_binary_loaded_callback(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let mut header = vec![0u8; 2 * PAGE_SIZE];
        header[0..4].copy_from_slice(
            &crate::image::constants::MH_MAGIC_64.to_le_bytes(),
        );
        let mut task = MockTask::new(0x10_0000, header);

        engine.on_exec(&mut task, PROCESS_PATH);
        let ncmds = u32::from_le_bytes(task.bytes_at(0x10_0000 + 16, 4).try_into().unwrap());
        assert_eq!(ncmds, 1);
        assert_eq!(loaded.load(Ordering::SeqCst), 1);

        // Unregistered processes are ignored
        let mut other = MockTask::new(0x10_0000, vec![0u8; PAGE_SIZE]);
        engine.on_exec(&mut other, "/usr/bin/other-not-registered");
        assert!(other.writes.is_empty());
    }

    #[test]
    fn test_exec_before_activation_is_ignored() {
        let (files, _) = module_files(0x40);
        let mut engine = engine_without_shared_cache();
        engine.compile(&files).unwrap();

        let mut task = MockTask::new(0x10_0000, vec![0u8; PAGE_SIZE]);
        engine.on_exec(&mut task, PROCESS_PATH);
        assert!(task.writes.is_empty());
    }

    #[test]
    fn test_shared_region_flow_stores_slide_and_patches() {
        let (mut files, _) = module_files(0x40);
        let map = format!(
            "{MODULE_PATH}\n\t__TEXT {TEXT_START:#x} -> {:#x}\n",
            TEXT_START + 0x10000
        );
        files.insert("/map", map.into_bytes());

        let config = EngineConfig::builder()
            .shared_cache_maps(["/map"])
            .build();
        let mut engine = Repave::new(config, patch_set());
        engine.compile(&files).unwrap();
        engine.activate();

        let slide = 0x4000u64;
        // Section is page-aligned at its segment start in the module
        let seg_offset = SECTION_ADDR + 0x40;
        let mut task = MockTask::new(TEXT_START + slide, vec![0x90u8; 2 * PAGE_SIZE]);
        let off = seg_offset as usize;
        task.memory[off..off + 4].copy_from_slice(&[0x74, 0x02, 0x31, 0xC0]);

        engine.on_shared_region_slide(&mut task, slide);
        assert_eq!(
            task.bytes_at(TEXT_START + slide + seg_offset, 4),
            &[0xEB, 0x02, 0x31, 0xC0]
        );

        // A later exec reuses the stored slide instead of injecting
        engine.on_exec(&mut task, PROCESS_PATH);
        let header_untouched = task.bytes_at(TEXT_START + slide + 16, 8);
        assert_eq!(header_untouched, &[0x90u8; 8][..]);
    }

    #[test]
    fn test_missing_map_degrades_to_slow_mode() {
        let (files, _) = module_files(0x40);
        let config = EngineConfig::builder()
            .shared_cache_maps(["/definitely-missing"])
            .build();
        let mut engine = Repave::new(config, patch_set());
        engine.compile(&files).unwrap();
        assert!(!engine.shared_cache_patching);
    }

    #[test]
    fn test_attach_installs_hooks() {
        let image = host_image(&[VALIDATE_RANGE, EXEC_SWITCH, REGION_MAP, REGION_SLIDE]);
        let mut engine = Repave::new(EngineConfig::default(), patch_set());
        let mut substrate = MockHooking::default();

        engine
            .attach(&image, &mut substrate, &CallbackTargets::default())
            .unwrap();
        assert_eq!(substrate.installed.len(), 4);
        assert!(engine.has_exec_switch);

        engine.detach(&mut substrate);
        assert!(substrate.installed.is_empty());
    }

    #[test]
    fn test_attach_falls_back_to_page_validation() {
        let image = host_image(&[VALIDATE_PAGE]);
        let mut engine = engine_without_shared_cache();
        let mut substrate = MockHooking::default();

        engine
            .attach(&image, &mut substrate, &CallbackTargets::default())
            .unwrap();
        assert_eq!(substrate.installed.len(), 1);
        assert!(!engine.has_exec_switch);
    }

    #[test]
    fn test_attach_without_validation_entry_fails() {
        let image = host_image(&[EXEC_SWITCH]);
        let mut engine = engine_without_shared_cache();
        let mut substrate = MockHooking::default();

        let err = engine
            .attach(&image, &mut substrate, &CallbackTargets::default())
            .unwrap_err();
        assert!(matches!(err, Error::HookFailed(_)));
    }

    #[test]
    fn test_deferred_exec_patches_at_task_switch() {
        let (files, _) = module_files(0x40);
        let mut engine = engine_without_shared_cache();
        engine.compile(&files).unwrap();
        engine.activate();
        engine.has_exec_switch = true;

        let mut exec_task = MockTask::new(0x10_0000, vec![0u8; PAGE_SIZE]);
        engine.on_exec(&mut exec_task, PROCESS_PATH);
        assert!(exec_task.writes.is_empty());
        assert_eq!(engine.pending_path.as_deref(), Some(PROCESS_PATH));

        let mut header = vec![0u8; 2 * PAGE_SIZE];
        header[0..4].copy_from_slice(
            &crate::image::constants::MH_MAGIC_64.to_le_bytes(),
        );
        let mut new_task = MockTask::new(0x20_0000, header);
        engine.on_exec_switch(&mut new_task);
        let ncmds = u32::from_le_bytes(new_task.bytes_at(0x20_0000 + 16, 4).try_into().unwrap());
        assert_eq!(ncmds, 1);
        assert!(engine.pending_path.is_none());
    }
}
