//! The privileged host image: on-disk layout, symbol resolution, and the
//! slide between linked and running addresses.
//!
//! Nothing here needs build-time symbols or target cooperation: the symbol
//! table comes from the on-disk copy of the image, and the running base is
//! recovered by scanning backward from a privileged CPU hint for a header
//! signature sitting directly in front of a text segment.

mod write_guard;

pub use write_guard::WriteGuard;

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::image::constants::*;
use crate::image::header::{MachHeader, Nlist64, SegmentCommand, name_starts_with};
use crate::image::{ImageLayout, classify, commands, image_uuid, scan_header};
use crate::patch::Architecture;
use crate::platform::{Decompress, FileSource, ImageSource, KernelSpace};

/// Parsed state of the host image, ready to resolve symbols once the
/// slide is known.
pub struct KernelImage {
    layout: ImageLayout,
    linkedit: Vec<u8>,
    uuid: Option<[u8; 16]>,
    slide: u64,
    slide_set: bool,
    running_base: u64,
    memory_size: usize,
}

impl KernelImage {
    /// Probe an ordered path list for a loadable host image. When
    /// `kernel` is provided, candidates whose build identifier does not
    /// match the running image are rejected.
    pub fn load<K: KernelSpace>(
        paths: &[&Path],
        arch: Architecture,
        kernel: Option<&K>,
        decompressor: Option<&dyn Decompress>,
    ) -> Result<Self> {
        let mut last_error = Error::Malformed("no candidate paths".into());
        for path in paths {
            let source = FileSource::new(*path);
            match Self::from_source(&source, arch, kernel, decompressor) {
                Ok(image) => {
                    debug!(path = %path.display(), "found usable host image");
                    return Ok(image);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "candidate rejected");
                    last_error = e;
                }
            }
        }
        warn!("no suitable host image among candidates");
        Err(last_error)
    }

    /// Parse an image from raw bytes without a running-image identity
    /// check, for offline inspection and symbol lookups.
    pub fn parse<S: ImageSource + ?Sized>(
        source: &S,
        arch: Architecture,
        decompressor: Option<&dyn Decompress>,
    ) -> Result<Self> {
        enum Never {}
        impl KernelSpace for Never {
            fn privileged_base_hint(&self) -> u64 {
                match *self {}
            }
            fn read(&self, _address: u64, _buf: &mut [u8]) -> Result<()> {
                match *self {}
            }
            fn set_write_protection(&self, _enable: bool) -> Result<()> {
                match *self {}
            }
            fn disable_interrupts(&self) -> bool {
                match *self {}
            }
            fn enable_interrupts(&self) {
                match *self {}
            }
        }
        Self::from_source(source, arch, None::<&Never>, decompressor)
    }

    /// Parse one candidate image from raw bytes.
    pub fn from_source<S: ImageSource + ?Sized, K: KernelSpace>(
        source: &S,
        arch: Architecture,
        kernel: Option<&K>,
        decompressor: Option<&dyn Decompress>,
    ) -> Result<Self> {
        let classified = classify(source, arch, decompressor)?;
        let uuid = image_uuid(&classified.probe);

        if let Some(kernel) = kernel
            && !is_running_image(uuid, kernel)
        {
            return Err(Error::Malformed(
                "build identifier does not match the running image".into(),
            ));
        }

        let layout = scan_header(&classified.probe)?;
        if !layout.has_symbols() {
            return Err(Error::Malformed(format!(
                "missing linkedit or symbol table (linkedit {:#x}, symbols {:#x})",
                layout.linkedit_fileoff, layout.symbol_fileoff
            )));
        }

        let mut linkedit = vec![0u8; layout.linkedit_size as usize];
        classified.read_at(source, layout.linkedit_fileoff, &mut linkedit)?;

        Ok(Self {
            layout,
            linkedit,
            uuid,
            slide: 0,
            slide_set: false,
            running_base: 0,
            memory_size: 0,
        })
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.uuid
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// The computed slide, once set.
    pub fn slide(&self) -> Option<u64> {
        self.slide_set.then_some(self.slide)
    }

    pub fn running_base(&self) -> u64 {
        self.running_base
    }

    /// Running header position and the memory size known for it.
    pub fn running_position(&self) -> (u64, usize) {
        let size = if self.memory_size > 0 {
            self.memory_size
        } else {
            HEADER_PROBE_SIZE
        };
        (self.running_base, size)
    }

    /// Adopt a slide the embedding environment already knows.
    pub fn set_slide(&mut self, slide: u64, memory_size: usize) {
        self.slide = slide;
        self.slide_set = true;
        self.memory_size = memory_size;
        debug!(slide = format_args!("{slide:#x}"), "adopted explicit load slide");
    }

    /// Compute the slide by diffing the running text address against the
    /// on-disk linked address. Idempotent until `force` is passed.
    pub fn compute_slide<K: KernelSpace>(&mut self, kernel: &K, force: bool) -> Result<()> {
        if force {
            self.slide_set = false;
            self.running_base = 0;
            self.memory_size = 0;
        }
        if self.slide_set {
            return Ok(());
        }

        let base = find_base(kernel);
        if base == 0 {
            warn!("could not locate the running image base");
            return Err(Error::SlideNotSet);
        }

        let mut probe = vec![0u8; HEADER_PROBE_SIZE];
        kernel.read(base, &mut probe)?;
        let header = MachHeader::parse(&probe)?;

        let mut running_text = 0u64;
        for item in commands(&probe, &header) {
            let (cmd, offset) = item?;
            if cmd.cmd == LC_SEGMENT_64 {
                let seg = SegmentCommand::parse(&probe, offset, true)?;
                if name_starts_with(&seg.name, SEG_TEXT) {
                    running_text = seg.vmaddr;
                    break;
                }
            }
        }
        if running_text == 0 {
            return Err(Error::Malformed("running image has no text segment".into()));
        }

        self.running_base = base;
        self.slide = running_text.wrapping_sub(self.layout.linked_text_addr);
        self.slide_set = true;
        debug!(slide = format_args!("{:#x}", self.slide), "computed load slide");
        Ok(())
    }

    /// Resolve an exported symbol to its runtime address.
    ///
    /// Table offsets are rebased onto the linkedit buffer with checked
    /// arithmetic; anything out of range resolves to not-found rather
    /// than reading past the buffer. Zero is never a valid result.
    pub fn resolve(&self, name: &str) -> Result<u64> {
        if self.linkedit.is_empty() {
            return Err(Error::Malformed("no linkedit buffer loaded".into()));
        }
        if !self.slide_set {
            return Err(Error::SlideNotSet);
        }

        // File offsets are relative to the whole image; rebase them onto
        // the linkedit buffer and fail closed on underflow
        let not_found = || Error::SymbolNotFound(name.to_string());
        let symbol_base = (self.layout.symbol_fileoff as u64)
            .checked_sub(self.layout.linkedit_fileoff)
            .ok_or_else(not_found)?;
        let string_base = (self.layout.string_fileoff as u64)
            .checked_sub(self.layout.linkedit_fileoff)
            .ok_or_else(not_found)?;

        for index in 0..self.layout.symbol_count as u64 {
            let entry_offset = symbol_base + index * NLIST_64_SIZE as u64;
            let Ok(entry) = Nlist64::parse(&self.linkedit, entry_offset as usize) else {
                break;
            };
            let name_offset = string_base + entry.strx as u64;
            if cstr_matches(&self.linkedit, name_offset as usize, name) {
                let address = entry.value.wrapping_add(self.slide);
                debug!(
                    symbol = name,
                    address = format_args!("{address:#x}"),
                    unslid = format_args!("{:#x}", entry.value),
                    "resolved symbol"
                );
                return Ok(address);
            }
        }

        Err(not_found())
    }
}

/// Scan backward from the privileged base hint for a 64-bit header magic
/// immediately followed by a text segment command.
pub fn find_base<K: KernelSpace>(kernel: &K) -> u64 {
    let mut addr = kernel.privileged_base_hint();
    let mut magic = [0u8; 4];
    let mut segment = [0u8; SEGMENT_COMMAND_64_SIZE];

    while addr > 0 {
        if kernel.read(addr, &mut magic).is_ok()
            && u32::from_le_bytes(magic) == MH_MAGIC_64
            && kernel.read(addr + MACH_HEADER_64_SIZE as u64, &mut segment).is_ok()
            && name_starts_with(&segment[8..24], SEG_TEXT)
        {
            debug!(base = format_args!("{addr:#x}"), "found running header");
            return addr;
        }
        addr -= 1;
    }
    0
}

/// Two images are the same load when their 128-bit build identifiers
/// match; addresses and content hashes are never compared.
fn is_running_image<K: KernelSpace>(uuid: Option<[u8; 16]>, kernel: &K) -> bool {
    let base = find_base(kernel);
    if base == 0 {
        return false;
    }
    let mut probe = vec![0u8; HEADER_PROBE_SIZE];
    if kernel.read(base, &mut probe).is_err() {
        return false;
    }
    match (uuid, image_uuid(&probe)) {
        (Some(disk), Some(live)) => disk == live,
        _ => false,
    }
}

/// Compare a NUL-terminated string at `offset` against `name`, including
/// the terminator.
fn cstr_matches(buf: &[u8], offset: usize, name: &str) -> bool {
    let bytes = name.as_bytes();
    buf.get(offset..offset + bytes.len() + 1)
        .is_some_and(|s| &s[..bytes.len()] == bytes && s[bytes.len()] == 0)
}
