//! Segment and section tables.
//!
//! Both tables are flat arrays rebuilt from the load commands on every call.
//! A section refers to its owning segment by index only.

use std::ops::ControlFlow;

use super::constants::*;
use super::image::{LoadCommandRef, MachOImage};
use super::structs::*;
use crate::diag::Diagnostics;
use crate::error::Error;
use crate::util::{fixed_name, greater_than_add_or_overflow};

// =============================================================================
// Segment Info
// =============================================================================

/// One segment, normalized from LC_SEGMENT or LC_SEGMENT_64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Index in segment load command order
    pub index: u32,
    /// Segment name
    pub name: String,
    /// Virtual memory address
    pub vm_addr: u64,
    /// Virtual memory size
    pub vm_size: u64,
    /// File offset
    pub file_offset: u64,
    /// File size
    pub file_size: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection; this is what permission checks use
    pub init_prot: u32,
    /// SG_* flags
    pub flags: u32,
    /// Declared section count
    pub nsects: u32,
    /// i386 read-only segment with relocated sections
    pub text_relocs: bool,
    /// Largest section alignment (power of two)
    pub p2align: u32,
    /// Distance from vmaddr to the end of the last section
    pub size_of_sections: u64,
    /// File offset of the segment load command
    pub load_command_offset: usize,
}

impl SegmentInfo {
    #[inline]
    pub fn readable(&self) -> bool {
        self.init_prot & VM_PROT_READ != 0
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.init_prot & VM_PROT_WRITE != 0
    }

    #[inline]
    pub fn executable(&self) -> bool {
        self.init_prot & VM_PROT_EXECUTE != 0
    }

    /// Returns true if this is the __TEXT segment.
    #[inline]
    pub fn is_text(&self) -> bool {
        self.name == "__TEXT"
    }

    /// Returns true if this is the __LINKEDIT segment.
    #[inline]
    pub fn is_linkedit(&self) -> bool {
        self.name == "__LINKEDIT"
    }

    /// Returns true if `addr` falls inside the vm range.
    #[inline]
    pub fn contains_vm_addr(&self, addr: u64) -> bool {
        addr >= self.vm_addr && addr - self.vm_addr < self.vm_size
    }

    /// Protection as an "rwx" string.
    pub fn permissions_string(&self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.readable() { 'r' } else { '-' });
        s.push(if self.writable() { 'w' } else { '-' });
        s.push(if self.executable() { 'x' } else { '-' });
        s
    }
}

// =============================================================================
// Section Info
// =============================================================================

/// One section, normalized from `section` or `section_64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Index of the owning segment
    pub segment_index: u32,
    /// Name of the owning segment (from the segment command)
    pub segment_name: String,
    /// Section name
    pub name: String,
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u32,
    /// Alignment (power of two)
    pub align: u32,
    /// File offset of relocations
    pub reloff: u32,
    /// Number of relocations
    pub nreloc: u32,
    /// Type and attributes
    pub flags: u32,
    /// Indirect symbol table index for pointer and stub sections
    pub reserved1: u32,
    /// Stub size for stub sections
    pub reserved2: u32,
    /// Section does not fit inside its segment's file-backed range
    pub malformed_range: bool,
}

impl SectionInfo {
    /// Returns the section type.
    #[inline]
    pub fn section_type(&self) -> u32 {
        self.flags & SECTION_TYPE
    }

    /// Returns the attribute bits.
    #[inline]
    pub fn attributes(&self) -> u32 {
        self.flags & SECTION_ATTRIBUTES
    }

    /// Returns "segment,section".
    pub fn full_name(&self) -> String {
        format!("{},{}", self.segment_name, self.name)
    }

    /// Returns true for zero-fill section types that have no file content.
    #[inline]
    pub fn is_zero_fill(&self) -> bool {
        matches!(
            self.section_type(),
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        )
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Raw segment command fields common to both layouts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSegment {
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
    pub is_64: bool,
}

impl RawSegment {
    /// Size of the fixed part of the command.
    pub fn command_size(&self) -> usize {
        if self.is_64 {
            SegmentCommand64::SIZE
        } else {
            SegmentCommand::SIZE
        }
    }

    /// Size of one section record.
    pub fn section_size(&self) -> usize {
        if self.is_64 {
            Section64::SIZE
        } else {
            Section::SIZE
        }
    }
}

/// Decodes a segment command, or `None` if `cmd` is not a segment or is too
/// small to hold one.
pub(crate) fn decode_segment(cmd: &LoadCommandRef<'_>) -> Option<RawSegment> {
    match cmd.cmd {
        LC_SEGMENT_64 => cmd.read::<SegmentCommand64>().map(|s| RawSegment {
            segname: s.segname,
            vmaddr: s.vmaddr,
            vmsize: s.vmsize,
            fileoff: s.fileoff,
            filesize: s.filesize,
            maxprot: s.maxprot,
            initprot: s.initprot,
            nsects: s.nsects,
            flags: s.flags,
            is_64: true,
        }),
        LC_SEGMENT => cmd.read::<SegmentCommand>().map(|s| RawSegment {
            segname: s.segname,
            vmaddr: s.vmaddr as u64,
            vmsize: s.vmsize as u64,
            fileoff: s.fileoff as u64,
            filesize: s.filesize as u64,
            maxprot: s.maxprot,
            initprot: s.initprot,
            nsects: s.nsects,
            flags: s.flags,
            is_64: false,
        }),
        _ => None,
    }
}

/// Raw section record fields common to both layouts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSection {
    pub sectname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

/// Decodes the sections that fit inside the segment command. Sections
/// beyond `cmdsize` are silently dropped; validation reports the mismatch.
pub(crate) fn decode_sections(cmd: &LoadCommandRef<'_>, seg: &RawSegment) -> Vec<RawSection> {
    let base = seg.command_size();
    let stride = seg.section_size();
    let mut out = Vec::new();
    for i in 0..seg.nsects as usize {
        let Some(at) = i.checked_mul(stride).and_then(|o| o.checked_add(base)) else {
            break;
        };
        let raw = if seg.is_64 {
            read_struct::<Section64>(cmd.bytes, at).map(|s| RawSection {
                sectname: s.sectname,
                addr: s.addr,
                size: s.size,
                offset: s.offset,
                align: s.align,
                reloff: s.reloff,
                nreloc: s.nreloc,
                flags: s.flags,
                reserved1: s.reserved1,
                reserved2: s.reserved2,
            })
        } else {
            read_struct::<Section>(cmd.bytes, at).map(|s| RawSection {
                sectname: s.sectname,
                addr: s.addr as u64,
                size: s.size as u64,
                offset: s.offset,
                align: s.align,
                reloff: s.reloff,
                nreloc: s.nreloc,
                flags: s.flags,
                reserved1: s.reserved1,
                reserved2: s.reserved2,
            })
        };
        match raw {
            Some(raw) => out.push(raw),
            None => break,
        }
    }
    out
}

fn build_segment_info(
    cmd: &LoadCommandRef<'_>,
    raw: &RawSegment,
    sections: &[RawSection],
    index: u32,
    intel32: bool,
) -> SegmentInfo {
    let mut size_of_sections = raw.vmsize;
    let mut p2align = 0;
    let mut has_reloc_sections = false;
    for sect in sections {
        size_of_sections = sect.addr.wrapping_add(sect.size).wrapping_sub(raw.vmaddr);
        p2align = p2align.max(sect.align);
        if sect.flags & (S_ATTR_EXT_RELOC | S_ATTR_LOC_RELOC) != 0 {
            has_reloc_sections = true;
        }
    }
    let writable = raw.initprot & VM_PROT_WRITE != 0;
    SegmentInfo {
        index,
        name: fixed_name(&raw.segname),
        vm_addr: raw.vmaddr,
        vm_size: raw.vmsize,
        file_offset: raw.fileoff,
        file_size: raw.filesize,
        max_prot: raw.maxprot,
        init_prot: raw.initprot,
        flags: raw.flags,
        nsects: raw.nsects,
        text_relocs: !raw.is_64 && intel32 && !writable && has_reloc_sections,
        p2align,
        size_of_sections,
        load_command_offset: cmd.offset,
    }
}

// =============================================================================
// Iteration
// =============================================================================

impl<'a> MachOImage<'a> {
    /// Calls `f` for every segment in load command order.
    pub fn for_each_segment<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(&SegmentInfo) -> ControlFlow<()>,
    {
        let intel32 = self.cputype() == CPU_TYPE_I386;
        let mut index = 0u32;
        let mut failure = None;
        self.for_each_load_command(diag, |cmd| {
            if cmd.cmd != LC_SEGMENT && cmd.cmd != LC_SEGMENT_64 {
                return ControlFlow::Continue(());
            }
            let Some(raw) = decode_segment(cmd) else {
                failure = Some(Error::MalformedSegment(format!(
                    "load command size too small for {}",
                    cmd.name()
                )));
                return ControlFlow::Break(());
            };
            let sections = decode_sections(cmd, &raw);
            let info = build_segment_info(cmd, &raw, &sections, index, intel32);
            index += 1;
            f(&info)
        });
        if let Some(err) = failure {
            diag.error(err);
        }
    }

    /// Returns all segments. Walk errors truncate the list.
    pub fn segments(&self) -> Vec<SegmentInfo> {
        let mut diag = Diagnostics::new().with_verbosity(0);
        let mut out = Vec::new();
        self.for_each_segment(&mut diag, |seg| {
            out.push(seg.clone());
            ControlFlow::Continue(())
        });
        out
    }

    /// Calls `f` for every section of every segment.
    pub fn for_each_section<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(&SectionInfo) -> ControlFlow<()>,
    {
        let mut index = 0u32;
        let mut failure = None;
        self.for_each_load_command(diag, |cmd| {
            if cmd.cmd != LC_SEGMENT && cmd.cmd != LC_SEGMENT_64 {
                return ControlFlow::Continue(());
            }
            let Some(raw) = decode_segment(cmd) else {
                failure = Some(Error::MalformedSegment(format!(
                    "load command size too small for {}",
                    cmd.name()
                )));
                return ControlFlow::Break(());
            };
            let segment_name = fixed_name(&raw.segname);
            let file_end = raw.vmaddr.wrapping_add(raw.filesize);
            for sect in decode_sections(cmd, &raw) {
                let info = SectionInfo {
                    segment_index: index,
                    segment_name: segment_name.clone(),
                    name: fixed_name(&sect.sectname),
                    addr: sect.addr,
                    size: sect.size,
                    file_offset: sect.offset,
                    align: sect.align,
                    reloff: sect.reloff,
                    nreloc: sect.nreloc,
                    flags: sect.flags,
                    reserved1: sect.reserved1,
                    reserved2: sect.reserved2,
                    malformed_range: sect.addr < raw.vmaddr
                        || greater_than_add_or_overflow(sect.addr, sect.size, file_end),
                };
                f(&info)?;
            }
            index += 1;
            ControlFlow::Continue(())
        });
        if let Some(err) = failure {
            diag.error(err);
        }
    }

    /// Returns all sections. Walk errors truncate the list.
    pub fn sections(&self) -> Vec<SectionInfo> {
        let mut diag = Diagnostics::new().with_verbosity(0);
        let mut out = Vec::new();
        self.for_each_section(&mut diag, |sect| {
            out.push(sect.clone());
            ControlFlow::Continue(())
        });
        out
    }

    /// Finds a segment by name.
    pub fn segment_named(&self, name: &str) -> Option<SegmentInfo> {
        self.segments().into_iter().find(|s| s.name == name)
    }

    /// Finds a section by segment and section name.
    pub fn find_section(&self, segment: &str, section: &str) -> Option<SectionInfo> {
        self.sections()
            .into_iter()
            .find(|s| s.segment_name == segment && s.name == section)
    }

    /// vmaddr of __TEXT, or 0 if there is none.
    pub fn preferred_load_address(&self) -> u64 {
        self.segment_named("__TEXT").map(|s| s.vm_addr).unwrap_or(0)
    }

    /// Index of the __LINKEDIT segment.
    pub fn linkedit_segment_index(&self) -> Option<u32> {
        self.segments().into_iter().find(|s| s.is_linkedit()).map(|s| s.index)
    }

    /// Maps a vm address to a file offset through the segment table.
    pub fn vm_addr_to_file_offset(&self, addr: u64) -> Option<u64> {
        self.segments()
            .iter()
            .find(|s| s.contains_vm_addr(addr) && addr - s.vm_addr < s.file_size)
            .map(|s| s.file_offset + (addr - s.vm_addr))
    }
}
