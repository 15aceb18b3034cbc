//! Mach-O format constants shared by the reader and the header map.

/// 64-bit Mach-O header magic
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
/// 32-bit Mach-O header magic
pub const MH_MAGIC: u32 = 0xfeedface;
/// Fat (universal) wrapper magic in big-endian byte order
pub const FAT_MAGIC: u32 = 0xcafebabe;
/// Fat wrapper magic as read natively on a little-endian host
pub const FAT_CIGAM: u32 = 0xbebafeca;
/// Compressed kernel wrapper magic ("comp")
pub const COMP_MAGIC: u32 = 0x706d_6f63;

// Load command types
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;

// CPU types
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;

/// Segment holding executable code; its linked vm address anchors the slide
pub const SEG_TEXT: &str = "__TEXT";
/// Segment holding the symbol and string tables
pub const SEG_LINKEDIT: &str = "__LINKEDIT";

/// Bytes read when probing a header; load commands must fit inside
pub const HEADER_PROBE_SIZE: usize = 4096;

pub const MACH_HEADER_SIZE: usize = 28;
pub const MACH_HEADER_64_SIZE: usize = 32;
pub const FAT_HEADER_SIZE: usize = 8;
pub const FAT_ARCH_SIZE: usize = 20;
pub const SEGMENT_COMMAND_SIZE: usize = 56;
pub const SEGMENT_COMMAND_64_SIZE: usize = 72;
pub const SECTION_SIZE: usize = 68;
pub const SECTION_64_SIZE: usize = 80;
pub const SYMTAB_COMMAND_SIZE: usize = 24;
pub const NLIST_64_SIZE: usize = 16;
/// Compressed wrapper header: magic, algorithm, decompressed, compressed
pub const COMP_HEADER_SIZE: usize = 16;
