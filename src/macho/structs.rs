//! Mach-O binary structures.
//!
//! These structures match the on-disk format of Mach-O files. All of them are
//! read by copy from untrusted buffers with [`read_struct`], so alignment of
//! the source bytes never matters.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use super::constants::*;
use crate::util::fixed_name;

/// Copies a `T` out of `data` at `offset`, or `None` if it does not fit.
#[inline]
pub fn read_struct<T: FromBytes>(data: &[u8], offset: usize) -> Option<T> {
    let bytes = data.get(offset..)?;
    T::read_from_prefix(bytes).ok().map(|(value, _)| value)
}

fn set_fixed_name(field: &mut [u8; 16], name: &str) {
    *field = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    field[..len].copy_from_slice(&bytes[..len]);
}

// =============================================================================
// Header Structures
// =============================================================================

/// 32-bit Mach-O header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader {
    /// Magic number (MH_MAGIC)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
}

impl MachHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;
}

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number (MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;
}

impl Default for MachHeader64 {
    fn default() -> Self {
        Self {
            magic: MH_MAGIC_64,
            cputype: 0,
            cpusubtype: 0,
            filetype: 0,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        }
    }
}

// =============================================================================
// Load Command Header
// =============================================================================

/// Generic load command header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Type of load command
    pub cmd: u32,
    /// Size of load command
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segment Commands
// =============================================================================

/// 32-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand {
    /// LC_SEGMENT
    pub cmd: u32,
    /// Size of this load command, including sections
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u32,
    /// Virtual memory size
    pub vmsize: u32,
    /// File offset
    pub fileoff: u32,
    /// Amount of file to map
    pub filesize: u32,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 56;

    /// Returns the segment name.
    pub fn name(&self) -> String {
        fixed_name(&self.segname)
    }

    /// Sets the segment name from a string.
    pub fn set_name(&mut self, name: &str) {
        set_fixed_name(&mut self.segname, name);
    }
}

impl Default for SegmentCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT,
            cmdsize: Self::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

/// 64-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size of this load command, including sections
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file to map
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 72;

    /// Returns the segment name.
    pub fn name(&self) -> String {
        fixed_name(&self.segname)
    }

    /// Sets the segment name from a string.
    pub fn set_name(&mut self, name: &str) {
        set_fixed_name(&mut self.segname, name);
    }
}

impl Default for SegmentCommand64 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: Self::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// 32-bit section.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u32,
    /// Size in bytes
    pub size: u32,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Type and attributes
    pub flags: u32,
    /// Indirect symbol index for pointer and stub sections
    pub reserved1: u32,
    /// Stub size for stub sections
    pub reserved2: u32,
}

impl Section {
    /// Size of a section entry.
    pub const SIZE: usize = 68;

    /// Sets the section and segment names.
    pub fn set_names(&mut self, segment: &str, section: &str) {
        set_fixed_name(&mut self.segname, segment);
        set_fixed_name(&mut self.sectname, section);
    }
}

/// 64-bit section.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Type and attributes
    pub flags: u32,
    /// Indirect symbol index for pointer and stub sections
    pub reserved1: u32,
    /// Stub size for stub sections
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl Section64 {
    /// Size of a section entry.
    pub const SIZE: usize = 80;

    /// Sets the section and segment names.
    pub fn set_names(&mut self, segment: &str, section: &str) {
        set_fixed_name(&mut self.segname, segment);
        set_fixed_name(&mut self.sectname, section);
    }
}

// =============================================================================
// Symbol Table Commands
// =============================================================================

/// Symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Symbol table offset
    pub symoff: u32,
    /// Number of symbol table entries
    pub nsyms: u32,
    /// String table offset
    pub stroff: u32,
    /// String table size in bytes
    pub strsize: u32,
}

impl SymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

impl Default for SymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SYMTAB,
            cmdsize: Self::SIZE as u32,
            symoff: 0,
            nsyms: 0,
            stroff: 0,
            strsize: 0,
        }
    }
}

/// Dynamic symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Index of local symbols
    pub ilocalsym: u32,
    /// Number of local symbols
    pub nlocalsym: u32,
    /// Index of externally defined symbols
    pub iextdefsym: u32,
    /// Number of externally defined symbols
    pub nextdefsym: u32,
    /// Index of undefined symbols
    pub iundefsym: u32,
    /// Number of undefined symbols
    pub nundefsym: u32,
    /// File offset to table of contents
    pub tocoff: u32,
    /// Number of entries in table of contents
    pub ntoc: u32,
    /// File offset to module table
    pub modtaboff: u32,
    /// Number of module table entries
    pub nmodtab: u32,
    /// Offset to referenced symbol table
    pub extrefsymoff: u32,
    /// Number of referenced symbol table entries
    pub nextrefsyms: u32,
    /// File offset to the indirect symbol table
    pub indirectsymoff: u32,
    /// Number of indirect symbol table entries
    pub nindirectsyms: u32,
    /// Offset to external relocation entries
    pub extreloff: u32,
    /// Number of external relocation entries
    pub nextrel: u32,
    /// Offset to local relocation entries
    pub locreloff: u32,
    /// Number of local relocation entries
    pub nlocrel: u32,
}

impl DysymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 80;
}

impl Default for DysymtabCommand {
    fn default() -> Self {
        let mut cmd = Self::new_zeroed();
        cmd.cmd = LC_DYSYMTAB;
        cmd.cmdsize = Self::SIZE as u32;
        cmd
    }
}

/// 32-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist {
    /// Index into the string table
    pub n_strx: u32,
    /// Type flag
    pub n_type: u8,
    /// Section number or NO_SECT
    pub n_sect: u8,
    /// Description (library ordinal, weak bits)
    pub n_desc: u16,
    /// Value of this symbol
    pub n_value: u32,
}

impl Nlist {
    /// Size of a symbol entry.
    pub const SIZE: usize = 12;
}

/// 64-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// Index into the string table
    pub n_strx: u32,
    /// Type flag
    pub n_type: u8,
    /// Section number or NO_SECT
    pub n_sect: u8,
    /// Description (library ordinal, weak bits)
    pub n_desc: u16,
    /// Value of this symbol
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of a symbol entry.
    pub const SIZE: usize = 16;
}

/// Classic relocation entry.
///
/// The second word packs `r_symbolnum:24, r_pcrel:1, r_length:2, r_extern:1,
/// r_type:4` from the low bit up.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RelocationInfo {
    /// Offset from the relocation base address
    pub r_address: i32,
    /// Packed bit fields
    pub r_info: u32,
}

impl RelocationInfo {
    /// Size of a relocation entry.
    pub const SIZE: usize = 8;

    /// Builds a relocation entry from its fields.
    pub fn new(address: i32, symbolnum: u32, pcrel: bool, length: u8, external: bool, kind: u8) -> Self {
        let r_info = (symbolnum & 0x00FF_FFFF)
            | ((pcrel as u32) << 24)
            | (((length & 0x3) as u32) << 25)
            | ((external as u32) << 27)
            | (((kind & 0xF) as u32) << 28);
        Self { r_address: address, r_info }
    }

    #[inline]
    pub fn symbolnum(&self) -> u32 {
        self.r_info & 0x00FF_FFFF
    }

    #[inline]
    pub fn pcrel(&self) -> bool {
        (self.r_info >> 24) & 1 != 0
    }

    /// log2 of the relocated width.
    #[inline]
    pub fn length(&self) -> u8 {
        ((self.r_info >> 25) & 0x3) as u8
    }

    #[inline]
    pub fn is_extern(&self) -> bool {
        (self.r_info >> 27) & 1 != 0
    }

    #[inline]
    pub fn kind(&self) -> u8 {
        ((self.r_info >> 28) & 0xF) as u8
    }
}

// =============================================================================
// LINKEDIT Commands
// =============================================================================

/// Compressed dyld info command (LC_DYLD_INFO / LC_DYLD_INFO_ONLY).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset to rebase info
    pub rebase_off: u32,
    /// Size of rebase info
    pub rebase_size: u32,
    /// File offset to binding info
    pub bind_off: u32,
    /// Size of binding info
    pub bind_size: u32,
    /// File offset to weak binding info
    pub weak_bind_off: u32,
    /// Size of weak binding info
    pub weak_bind_size: u32,
    /// File offset to lazy binding info
    pub lazy_bind_off: u32,
    /// Size of lazy binding info
    pub lazy_bind_size: u32,
    /// File offset to export info
    pub export_off: u32,
    /// Size of export info
    pub export_size: u32,
}

impl DyldInfoCommand {
    /// Size of this command.
    pub const SIZE: usize = 48;
}

impl Default for DyldInfoCommand {
    fn default() -> Self {
        let mut cmd = Self::new_zeroed();
        cmd.cmd = LC_DYLD_INFO_ONLY;
        cmd.cmdsize = Self::SIZE as u32;
        cmd
    }
}

/// Generic LINKEDIT data command (function starts, chained fixups, ...).
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LinkeditDataCommand {
    /// Command type
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset of data in __LINKEDIT
    pub dataoff: u32,
    /// File size of data in __LINKEDIT
    pub datasize: u32,
}

impl LinkeditDataCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;

    /// Creates a command of the given kind.
    pub fn new(cmd: u32, dataoff: u32, datasize: u32) -> Self {
        Self {
            cmd,
            cmdsize: Self::SIZE as u32,
            dataoff,
            datasize,
        }
    }
}

// =============================================================================
// Dylib and Path Commands
// =============================================================================

/// Dylib command (LC_ID_DYLIB, LC_LOAD_DYLIB, ...).
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylibCommand {
    /// Command type
    pub cmd: u32,
    /// Size of this load command, including the path
    pub cmdsize: u32,
    /// Offset of the path string from the start of the command
    pub name_offset: u32,
    /// Build timestamp
    pub timestamp: u32,
    /// Current version
    pub current_version: u32,
    /// Compatibility version
    pub compatibility_version: u32,
}

impl DylibCommand {
    /// Size of this command (without path).
    pub const SIZE: usize = 24;
}

/// Runpath command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RpathCommand {
    /// LC_RPATH
    pub cmd: u32,
    /// Size of this load command, including the path
    pub cmdsize: u32,
    /// Offset of the path string from the start of the command
    pub path_offset: u32,
}

impl RpathCommand {
    /// Size of this command (without path).
    pub const SIZE: usize = 12;
}

/// Dylinker command (LC_LOAD_DYLINKER).
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylinkerCommand {
    /// LC_LOAD_DYLINKER or LC_ID_DYLINKER
    pub cmd: u32,
    /// Size of this load command, including the path
    pub cmdsize: u32,
    /// Offset of the path string from the start of the command
    pub name_offset: u32,
}

impl DylinkerCommand {
    /// Size of this command (without path).
    pub const SIZE: usize = 12;
}

// =============================================================================
// Entry Point Commands
// =============================================================================

/// Main entry point command (LC_MAIN).
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EntryPointCommand {
    /// LC_MAIN
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset of main()
    pub entryoff: u64,
    /// Initial stack size, if not zero
    pub stacksize: u64,
}

impl EntryPointCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

/// Thread command header; register state follows.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ThreadCommand {
    /// LC_THREAD or LC_UNIXTHREAD
    pub cmd: u32,
    /// Size of this load command, including register state
    pub cmdsize: u32,
    /// Thread state flavor
    pub flavor: u32,
    /// Count of u32s in the thread state
    pub count: u32,
}

impl ThreadCommand {
    /// Size of the header (without register state).
    pub const SIZE: usize = 16;
}

/// 32-bit image routines command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RoutinesCommand {
    /// LC_ROUTINES
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Address of the initialization routine
    pub init_address: u32,
    /// Index into the module table
    pub init_module: u32,
    /// Reserved
    pub reserved: [u32; 6],
}

impl RoutinesCommand {
    /// Size of this command.
    pub const SIZE: usize = 40;
}

/// 64-bit image routines command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RoutinesCommand64 {
    /// LC_ROUTINES_64
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Address of the initialization routine
    pub init_address: u64,
    /// Index into the module table
    pub init_module: u64,
    /// Reserved
    pub reserved: [u64; 6],
}

impl RoutinesCommand64 {
    /// Size of this command.
    pub const SIZE: usize = 72;
}

// =============================================================================
// Version Commands
// =============================================================================

/// Minimum OS version command (LC_VERSION_MIN_*).
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct VersionMinCommand {
    /// LC_VERSION_MIN_MACOSX, _IPHONEOS, _TVOS or _WATCHOS
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// X.Y.Z encoded in nibbles xxxx.yy.zz
    pub version: u32,
    /// X.Y.Z encoded in nibbles xxxx.yy.zz
    pub sdk: u32,
}

impl VersionMinCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

/// Build version command (LC_BUILD_VERSION); tool entries follow.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BuildVersionCommand {
    /// LC_BUILD_VERSION
    pub cmd: u32,
    /// Size of this load command, including tool entries
    pub cmdsize: u32,
    /// Platform identifier
    pub platform: u32,
    /// Minimum OS version
    pub minos: u32,
    /// SDK version
    pub sdk: u32,
    /// Number of tool entries following this
    pub ntools: u32,
}

impl BuildVersionCommand {
    /// Size of this command (without tools).
    pub const SIZE: usize = 24;
}

/// UUID command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct UuidCommand {
    /// LC_UUID
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// 128-bit UUID
    pub uuid: [u8; 16],
}

impl UuidCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

// =============================================================================
// Chained Fixups
// =============================================================================

/// Header of the LC_DYLD_CHAINED_FIXUPS payload.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldChainedFixupsHeader {
    /// 0
    pub fixups_version: u32,
    /// Offset of dyld_chained_starts_in_image in the payload
    pub starts_offset: u32,
    /// Offset of the imports table in the payload
    pub imports_offset: u32,
    /// Offset of the symbol strings in the payload
    pub symbols_offset: u32,
    /// Number of imported symbol names
    pub imports_count: u32,
    /// DYLD_CHAINED_IMPORT*
    pub imports_format: u32,
    /// 0 => uncompressed
    pub symbols_format: u32,
}

impl DyldChainedFixupsHeader {
    /// Size of the header.
    pub const SIZE: usize = 28;
}

/// Fixed part of `dyld_chained_starts_in_segment`; `page_start[page_count]`
/// follows. The on-disk record is 22 bytes and not padded, so it is decoded
/// field by field instead of through a derived layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainedStartsInSegment {
    /// Size of this record, including page starts and overflow entries
    pub size: u32,
    /// 0x1000 or 0x4000
    pub page_size: u16,
    /// DYLD_CHAINED_PTR_*
    pub pointer_format: u16,
    /// Offset of the segment from the image base
    pub segment_offset: u64,
    /// For 32-bit formats, values above this are non-pointers
    pub max_valid_pointer: u32,
    /// Number of pages in the segment
    pub page_count: u16,
}

impl ChainedStartsInSegment {
    /// Size of the fixed part.
    pub const SIZE: usize = 22;

    /// Decodes the fixed part at `offset`.
    pub fn parse(data: &[u8], offset: usize) -> Option<Self> {
        use crate::util::{get_u16_le, get_u32_le, get_u64_le};
        Some(Self {
            size: get_u32_le(data, offset)?,
            page_size: get_u16_le(data, offset + 4)?,
            pointer_format: get_u16_le(data, offset + 6)?,
            segment_offset: get_u64_le(data, offset + 8)?,
            max_valid_pointer: get_u32_le(data, offset + 16)?,
            page_count: get_u16_le(data, offset + 20)?,
        })
    }

    /// Encodes the fixed part.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..6].copy_from_slice(&self.page_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.pointer_format.to_le_bytes());
        out[8..16].copy_from_slice(&self.segment_offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.max_valid_pointer.to_le_bytes());
        out[20..22].copy_from_slice(&self.page_count.to_le_bytes());
        out
    }
}

// =============================================================================
// Fat Headers
// =============================================================================

/// One architecture entry of a fat header, already converted from big-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FatArch {
    /// CPU type of the slice
    pub cputype: u32,
    /// CPU subtype of the slice
    pub cpusubtype: u32,
    /// File offset of the slice
    pub offset: u64,
    /// Size of the slice
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl FatArch {
    /// Size of a `fat_arch` record.
    pub const SIZE: usize = 20;
    /// Size of a `fat_arch_64` record.
    pub const SIZE_64: usize = 32;

    /// Decodes a big-endian fat_arch (or fat_arch_64) record.
    pub fn parse(data: &[u8], offset: usize, is_64: bool) -> Option<Self> {
        use byteorder::{BigEndian, ByteOrder};
        let len = if is_64 { Self::SIZE_64 } else { Self::SIZE };
        let raw = data.get(offset..offset.checked_add(len)?)?;
        if is_64 {
            Some(Self {
                cputype: BigEndian::read_u32(&raw[0..]),
                cpusubtype: BigEndian::read_u32(&raw[4..]),
                offset: BigEndian::read_u64(&raw[8..]),
                size: BigEndian::read_u64(&raw[16..]),
                align: BigEndian::read_u32(&raw[24..]),
            })
        } else {
            Some(Self {
                cputype: BigEndian::read_u32(&raw[0..]),
                cpusubtype: BigEndian::read_u32(&raw[4..]),
                offset: BigEndian::read_u32(&raw[8..]) as u64,
                size: BigEndian::read_u32(&raw[12..]) as u64,
                align: BigEndian::read_u32(&raw[16..]),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<MachHeader>(), MachHeader::SIZE);
        assert_eq!(std::mem::size_of::<MachHeader64>(), MachHeader64::SIZE);
        assert_eq!(std::mem::size_of::<SegmentCommand>(), SegmentCommand::SIZE);
        assert_eq!(std::mem::size_of::<SegmentCommand64>(), SegmentCommand64::SIZE);
        assert_eq!(std::mem::size_of::<Section>(), Section::SIZE);
        assert_eq!(std::mem::size_of::<Section64>(), Section64::SIZE);
        assert_eq!(std::mem::size_of::<DysymtabCommand>(), DysymtabCommand::SIZE);
        assert_eq!(std::mem::size_of::<DyldInfoCommand>(), DyldInfoCommand::SIZE);
        assert_eq!(std::mem::size_of::<Nlist>(), Nlist::SIZE);
        assert_eq!(std::mem::size_of::<Nlist64>(), Nlist64::SIZE);
        assert_eq!(std::mem::size_of::<RoutinesCommand>(), RoutinesCommand::SIZE);
        assert_eq!(std::mem::size_of::<RoutinesCommand64>(), RoutinesCommand64::SIZE);
        assert_eq!(std::mem::size_of::<DyldChainedFixupsHeader>(), DyldChainedFixupsHeader::SIZE);
    }

    #[test]
    fn test_relocation_bitfields() {
        let reloc = RelocationInfo::new(0x10, 0x123456, false, 3, true, 0);
        assert_eq!(reloc.symbolnum(), 0x123456);
        assert!(!reloc.pcrel());
        assert_eq!(reloc.length(), 3);
        assert!(reloc.is_extern());
        assert_eq!(reloc.kind(), 0);
    }

    #[test]
    fn test_read_struct_bounds() {
        let mut seg = SegmentCommand64::default();
        seg.set_name("__TEXT");
        let bytes = seg.as_bytes();
        let parsed: SegmentCommand64 = read_struct(bytes, 0).unwrap();
        assert_eq!(parsed.name(), "__TEXT");
        assert!(read_struct::<SegmentCommand64>(bytes, 1).is_none());
        assert!(read_struct::<LoadCommand>(bytes, usize::MAX).is_none());
    }

    #[test]
    fn test_fat_arch_big_endian() {
        let raw = [
            0x01, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
            0x10, 0x00, 0x00, 0x00, 0x00, 0x0E,
        ];
        let arch = FatArch::parse(&raw, 0, false).unwrap();
        assert_eq!(arch.cputype, CPU_TYPE_ARM64);
        assert_eq!(arch.offset, 0x4000);
        assert_eq!(arch.size, 0x1000);
        assert_eq!(arch.align, 14);
    }

    #[test]
    fn test_chained_starts_in_segment_codec() {
        let starts = ChainedStartsInSegment {
            size: 24,
            page_size: 0x4000,
            pointer_format: DYLD_CHAINED_PTR_64,
            segment_offset: 0x8000,
            max_valid_pointer: 0,
            page_count: 1,
        };
        assert_eq!(ChainedStartsInSegment::parse(&starts.to_bytes(), 0), Some(starts));
    }
}
