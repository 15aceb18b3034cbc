//! Synthetic image construction for tests.

use super::constants::*;

/// Builds a minimal thin 64-bit image: header, load commands, and raw
/// contents placed at chosen file offsets. The buffer is padded to at
/// least the header probe size so classification can read it.
pub struct MachBuilder {
    cpu: u32,
    segments: Vec<SegmentSpec>,
    symtab: Option<(u32, u32, u32)>,
    uuid: Option<[u8; 16]>,
    contents: Vec<(usize, Vec<u8>)>,
    min_size: usize,
}

struct SegmentSpec {
    name: &'static str,
    vmaddr: u64,
    fileoff: u64,
    filesize: u64,
    sections: Vec<SectionSpec>,
}

struct SectionSpec {
    name: &'static str,
    addr: u64,
    size: u64,
    fileoff: u32,
}

impl MachBuilder {
    pub fn new() -> Self {
        Self {
            cpu: CPU_TYPE_X86_64,
            segments: Vec::new(),
            symtab: None,
            uuid: None,
            contents: Vec::new(),
            min_size: HEADER_PROBE_SIZE,
        }
    }

    pub fn cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn segment(mut self, name: &'static str, vmaddr: u64, fileoff: u64, filesize: u64) -> Self {
        self.segments.push(SegmentSpec {
            name,
            vmaddr,
            fileoff,
            filesize,
            sections: Vec::new(),
        });
        self
    }

    pub fn segment_with_section(
        mut self,
        seg_name: &'static str,
        vmaddr: u64,
        sect_name: &'static str,
        sect_addr: u64,
        sect_size: u64,
        sect_fileoff: u32,
    ) -> Self {
        self.segments.push(SegmentSpec {
            name: seg_name,
            vmaddr,
            fileoff: 0,
            filesize: 0,
            sections: vec![SectionSpec {
                name: sect_name,
                addr: sect_addr,
                size: sect_size,
                fileoff: sect_fileoff,
            }],
        });
        self
    }

    pub fn symtab(mut self, symoff: u32, nsyms: u32, stroff: u32) -> Self {
        self.symtab = Some((symoff, nsyms, stroff));
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Place raw bytes at a file offset (section or table contents).
    pub fn content(mut self, offset: usize, bytes: Vec<u8>) -> Self {
        self.contents.push((offset, bytes));
        self
    }

    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = self.min_size.max(size);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut cmds: Vec<u8> = Vec::new();
        let mut ncmds = 0u32;

        for seg in &self.segments {
            let cmdsize = SEGMENT_COMMAND_64_SIZE + seg.sections.len() * SECTION_64_SIZE;
            cmds.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
            cmds.extend_from_slice(&(cmdsize as u32).to_le_bytes());
            cmds.extend_from_slice(&name16(seg.name));
            cmds.extend_from_slice(&seg.vmaddr.to_le_bytes());
            cmds.extend_from_slice(&0u64.to_le_bytes()); // vmsize
            cmds.extend_from_slice(&seg.fileoff.to_le_bytes());
            cmds.extend_from_slice(&seg.filesize.to_le_bytes());
            cmds.extend_from_slice(&0u32.to_le_bytes()); // maxprot
            cmds.extend_from_slice(&0u32.to_le_bytes()); // initprot
            cmds.extend_from_slice(&(seg.sections.len() as u32).to_le_bytes());
            cmds.extend_from_slice(&0u32.to_le_bytes()); // flags
            for sect in &seg.sections {
                cmds.extend_from_slice(&name16(sect.name));
                cmds.extend_from_slice(&name16(seg.name));
                cmds.extend_from_slice(&sect.addr.to_le_bytes());
                cmds.extend_from_slice(&sect.size.to_le_bytes());
                cmds.extend_from_slice(&sect.fileoff.to_le_bytes());
                cmds.extend_from_slice(&[0u8; 28]); // align..reserved3
            }
            ncmds += 1;
        }

        if let Some((symoff, nsyms, stroff)) = self.symtab {
            cmds.extend_from_slice(&LC_SYMTAB.to_le_bytes());
            cmds.extend_from_slice(&(SYMTAB_COMMAND_SIZE as u32).to_le_bytes());
            cmds.extend_from_slice(&symoff.to_le_bytes());
            cmds.extend_from_slice(&nsyms.to_le_bytes());
            cmds.extend_from_slice(&stroff.to_le_bytes());
            cmds.extend_from_slice(&0u32.to_le_bytes()); // strsize
            ncmds += 1;
        }

        if let Some(uuid) = self.uuid {
            cmds.extend_from_slice(&LC_UUID.to_le_bytes());
            cmds.extend_from_slice(&24u32.to_le_bytes());
            cmds.extend_from_slice(&uuid);
            ncmds += 1;
        }

        let mut size = MACH_HEADER_64_SIZE + cmds.len();
        for (offset, bytes) in &self.contents {
            size = size.max(offset + bytes.len());
        }
        size = size.max(self.min_size);

        let mut buf = vec![0u8; size];
        buf[0..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cpu.to_le_bytes());
        buf[12..16].copy_from_slice(&2u32.to_le_bytes()); // filetype: executable
        buf[16..20].copy_from_slice(&ncmds.to_le_bytes());
        buf[20..24].copy_from_slice(&(cmds.len() as u32).to_le_bytes());
        buf[MACH_HEADER_64_SIZE..MACH_HEADER_64_SIZE + cmds.len()].copy_from_slice(&cmds);

        for (offset, bytes) in &self.contents {
            buf[*offset..offset + bytes.len()].copy_from_slice(bytes);
        }

        buf
    }
}

fn name16(name: &str) -> [u8; 16] {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    field
}

/// One raw 64-bit symbol entry.
pub fn nlist64(strx: u32, value: u64) -> Vec<u8> {
    let mut entry = Vec::with_capacity(NLIST_64_SIZE);
    entry.extend_from_slice(&strx.to_le_bytes());
    entry.extend_from_slice(&[0u8; 4]); // type, sect, desc
    entry.extend_from_slice(&value.to_le_bytes());
    entry
}

/// Wrap thin images into a big-endian fat container; each slice lands in
/// its own probe-sized slot.
pub fn fat_wrapper(entries: &[(u32, &[u8])]) -> Vec<u8> {
    let slot = |data: &[u8]| data.len().div_ceil(HEADER_PROBE_SIZE).max(1) * HEADER_PROBE_SIZE;

    let mut offsets = Vec::new();
    let mut cursor = HEADER_PROBE_SIZE;
    for (_, data) in entries {
        offsets.push(cursor);
        cursor += slot(data);
    }

    let mut buf = vec![0u8; cursor];
    buf[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&(entries.len() as u32).to_be_bytes());
    for (i, (cpu, data)) in entries.iter().enumerate() {
        let arch = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
        buf[arch..arch + 4].copy_from_slice(&cpu.to_be_bytes());
        buf[arch + 8..arch + 12].copy_from_slice(&(offsets[i] as u32).to_be_bytes());
        buf[arch + 12..arch + 16].copy_from_slice(&(data.len() as u32).to_be_bytes());
        buf[offsets[i]..offsets[i] + data.len()].copy_from_slice(data);
    }
    buf
}

/// Wrap a compressed payload into a "comp" container.
pub fn compressed_wrapper(algorithm: u32, payload: &[u8], decompressed_len: u32) -> Vec<u8> {
    let size = (COMP_HEADER_SIZE + payload.len()).max(HEADER_PROBE_SIZE);
    let mut buf = vec![0u8; size];
    buf[0..4].copy_from_slice(&COMP_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&algorithm.to_le_bytes());
    buf[8..12].copy_from_slice(&decompressed_len.to_be_bytes());
    buf[12..16].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    buf[COMP_HEADER_SIZE..COMP_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    buf
}
