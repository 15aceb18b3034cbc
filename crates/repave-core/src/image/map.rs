//! Single-pass extraction of layout facts from a classified header.
//!
//! Walks the load-command list once, bounded by the declared command count
//! and the bytes actually in memory. Unknown command types are skipped by
//! their declared size.

use tracing::debug;

use crate::error::{Error, Result};
use crate::patch::Architecture;

use super::constants::*;
use super::header::{
    LoadCommand, MachHeader, FatArch, SectionHeader, SegmentCommand, SymtabCommand, name_eq,
    name_starts_with, read_u32, slice,
};

/// Layout facts needed to solve symbols and compute the slide.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageLayout {
    /// On-disk linked vm address of the text-like segment
    pub linked_text_addr: u64,
    /// File offset and size of the metadata (linkedit) segment
    pub linkedit_fileoff: u64,
    pub linkedit_size: u64,
    /// Symbol table triple, relative to the start of the file
    pub symbol_fileoff: u32,
    pub symbol_count: u32,
    pub string_fileoff: u32,
}

impl ImageLayout {
    /// Whether the image carries everything symbol resolution needs.
    pub fn has_symbols(&self) -> bool {
        self.linkedit_fileoff != 0 && self.symbol_fileoff != 0
    }
}

/// Named section bounds inside a concrete image. Zero-size absence is
/// represented as `None` at the lookup, never as a partial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionBounds {
    pub segment_addr: u64,
    pub section_addr: u64,
    pub file_offset: u64,
    pub size: u64,
}

/// Bounded iterator over the load commands following `header`.
pub struct Commands<'a> {
    buf: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for Commands<'a> {
    type Item = Result<(LoadCommand, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let cmd = match LoadCommand::parse(self.buf, self.offset) {
            Ok(cmd) => cmd,
            Err(e) => return Some(Err(e)),
        };
        let start = self.offset;
        let end = start.checked_add(cmd.cmdsize as usize);
        if end.is_none_or(|e| e > self.buf.len()) {
            return Some(Err(Error::OutOfBounds {
                offset: start as u64,
                len: cmd.cmdsize as u64,
                size: self.buf.len() as u64,
            }));
        }
        self.offset = end.unwrap();
        Some(Ok((cmd, start)))
    }
}

pub fn commands<'a>(buf: &'a [u8], header: &MachHeader) -> Commands<'a> {
    Commands {
        buf,
        offset: header.size(),
        remaining: header.ncmds,
    }
}

/// Extract the text address, linkedit bounds and symbol-table triple from
/// a concrete 64-bit header.
pub fn scan_header(buf: &[u8]) -> Result<ImageLayout> {
    let header = MachHeader::parse(buf)?;
    if !header.is_64() {
        return Err(Error::Malformed("expected a 64-bit image".into()));
    }

    let mut layout = ImageLayout::default();
    for item in commands(buf, &header) {
        let (cmd, offset) = item?;
        match cmd.cmd {
            LC_SEGMENT_64 => {
                let seg = SegmentCommand::parse(buf, offset, true)?;
                if name_starts_with(&seg.name, SEG_TEXT) {
                    debug!(vmaddr = format_args!("{:#x}", seg.vmaddr), "found text segment");
                    layout.linked_text_addr = seg.vmaddr;
                } else if name_starts_with(&seg.name, SEG_LINKEDIT) {
                    debug!(
                        fileoff = format_args!("{:#x}", seg.fileoff),
                        size = seg.filesize,
                        "found linkedit segment"
                    );
                    layout.linkedit_fileoff = seg.fileoff;
                    layout.linkedit_size = seg.filesize;
                }
            }
            LC_SYMTAB => {
                let symtab = SymtabCommand::parse(buf, offset)?;
                layout.symbol_fileoff = symtab.symoff;
                layout.symbol_count = symtab.nsyms;
                layout.string_fileoff = symtab.stroff;
            }
            _ => {}
        }
    }

    Ok(layout)
}

/// Extract the 128-bit build identifier, if the image carries one.
pub fn image_uuid(buf: &[u8]) -> Option<[u8; 16]> {
    let header = MachHeader::parse(buf).ok()?;
    for item in commands(buf, &header) {
        let (cmd, offset) = item.ok()?;
        if cmd.cmd == LC_UUID {
            return slice(buf, offset + 8, 16).ok().map(|b| b.try_into().unwrap());
        }
    }
    None
}

/// Locate an arbitrary (segment, section) pair for `arch`, recursing into
/// fat wrappers. Absence and malformed input both fail closed to `None`.
pub fn find_section_bounds(
    buf: &[u8],
    arch: Architecture,
    segment: &str,
    section: &str,
) -> Option<SectionBounds> {
    let magic = read_u32(buf, 0).ok()?;
    if magic == FAT_MAGIC || magic == FAT_CIGAM {
        let swapped = magic == FAT_CIGAM;
        let mut count = read_u32(buf, 4).ok()?;
        if swapped {
            count = count.swap_bytes();
        }
        for i in 0..count as usize {
            let entry = FatArch::parse(buf, FAT_HEADER_SIZE + i * FAT_ARCH_SIZE, swapped).ok()?;
            if entry.cpu_type != arch.cpu_type() {
                continue;
            }
            let start = entry.offset as usize;
            let end = start.checked_add(entry.size as usize)?;
            if end > buf.len() {
                return None;
            }
            return find_section_bounds(&buf[start..end], arch, segment, section);
        }
        return None;
    }

    let header = MachHeader::parse(buf).ok()?;
    for item in commands(buf, &header) {
        let (cmd, offset) = item.ok()?;
        let is_64 = match cmd.cmd {
            LC_SEGMENT_64 => true,
            LC_SEGMENT => false,
            _ => continue,
        };
        let seg = SegmentCommand::parse(buf, offset, is_64).ok()?;
        if !name_eq(&seg.name, segment) {
            continue;
        }

        let mut section_offset = seg.sections_offset(offset);
        for _ in 0..seg.nsects {
            let sect = SectionHeader::parse(buf, section_offset, is_64).ok()?;
            if name_eq(&sect.name, section) {
                debug!(
                    section,
                    addr = format_args!("{:#x}", sect.addr),
                    size = sect.size,
                    "located section bounds"
                );
                return Some(SectionBounds {
                    segment_addr: seg.vmaddr,
                    section_addr: sect.addr,
                    file_offset: sect.fileoff as u64,
                    size: sect.size,
                });
            }
            section_offset += seg.section_size();
        }
    }
    None
}
