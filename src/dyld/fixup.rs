//! Normalized fixup records shared by every fixup encoding.
//!
//! Rebase opcodes, bind opcodes, classic relocations and the indirect symbol
//! table all describe the same two things: a location that needs sliding and
//! a location that needs a symbol. Each walker converts its encoding into
//! [`RebaseRecord`] or [`BindRecord`] and checks it against the segment
//! table through [`FixupContext`] before handing it out.

use std::borrow::Cow;
use std::fmt;

use crate::analyzer::{FormatRule, LinkEditInfo};
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::get_pointer_le;

// =============================================================================
// Fixup Kind
// =============================================================================

/// How the fixed-up location is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixupKind {
    /// 32-bit pointer in data
    Pointer32,
    /// 64-bit pointer in data
    Pointer64,
    /// 32-bit absolute address inside instructions (i386 only)
    TextAbsolute32,
    /// 32-bit pc-relative address inside instructions (i386 only)
    TextPcRel32,
    /// A type value no encoding defines
    Unknown(u8),
}

impl FixupKind {
    /// Maps a `REBASE_TYPE_*` / `BIND_TYPE_*` value. Both enumerations share
    /// their numbering.
    pub fn from_raw(raw: u8, is_64: bool) -> Self {
        match raw {
            REBASE_TYPE_POINTER if is_64 => FixupKind::Pointer64,
            REBASE_TYPE_POINTER => FixupKind::Pointer32,
            REBASE_TYPE_TEXT_ABSOLUTE32 => FixupKind::TextAbsolute32,
            REBASE_TYPE_TEXT_PCREL32 => FixupKind::TextPcRel32,
            other => FixupKind::Unknown(other),
        }
    }

    /// The pointer kind for the given pointer width.
    #[inline]
    pub fn pointer(pointer_size: u32) -> Self {
        if pointer_size == 8 {
            FixupKind::Pointer64
        } else {
            FixupKind::Pointer32
        }
    }

    #[inline]
    pub fn is_pointer(self) -> bool {
        matches!(self, FixupKind::Pointer32 | FixupKind::Pointer64)
    }

    #[inline]
    pub fn is_text(self) -> bool {
        matches!(self, FixupKind::TextAbsolute32 | FixupKind::TextPcRel32)
    }
}

impl fmt::Display for FixupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixupKind::Pointer32 => write!(f, "pointer32"),
            FixupKind::Pointer64 => write!(f, "pointer64"),
            FixupKind::TextAbsolute32 => write!(f, "text-abs32"),
            FixupKind::TextPcRel32 => write!(f, "text-pcrel32"),
            FixupKind::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

// =============================================================================
// Library Ordinal
// =============================================================================

/// Where a bound symbol is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryOrdinal {
    /// 1-based index into the dependent dylibs
    Dylib(u32),
    /// The image itself
    SelfImage,
    /// The main executable
    MainExecutable,
    /// Every loaded image, in load order
    FlatLookup,
    /// Weak definition coalescing across all images
    WeakLookup,
}

impl LibraryOrdinal {
    /// Decodes a raw ordinal, or `None` for a special value below
    /// `BIND_SPECIAL_DYLIB_WEAK_LOOKUP`.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            BIND_SPECIAL_DYLIB_SELF => Some(LibraryOrdinal::SelfImage),
            BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => Some(LibraryOrdinal::MainExecutable),
            BIND_SPECIAL_DYLIB_FLAT_LOOKUP => Some(LibraryOrdinal::FlatLookup),
            BIND_SPECIAL_DYLIB_WEAK_LOOKUP => Some(LibraryOrdinal::WeakLookup),
            n if n > 0 => Some(LibraryOrdinal::Dylib(n as u32)),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            LibraryOrdinal::Dylib(n) => n as i32,
            LibraryOrdinal::SelfImage => BIND_SPECIAL_DYLIB_SELF,
            LibraryOrdinal::MainExecutable => BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE,
            LibraryOrdinal::FlatLookup => BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
            LibraryOrdinal::WeakLookup => BIND_SPECIAL_DYLIB_WEAK_LOOKUP,
        }
    }
}

impl fmt::Display for LibraryOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryOrdinal::Dylib(n) => write!(f, "{}", n),
            LibraryOrdinal::SelfImage => write!(f, "self"),
            LibraryOrdinal::MainExecutable => write!(f, "main-executable"),
            LibraryOrdinal::FlatLookup => write!(f, "flat-namespace"),
            LibraryOrdinal::WeakLookup => write!(f, "weak"),
        }
    }
}

impl<'a> MachOImage<'a> {
    /// Library ordinal encoded in the high byte of an undefined symbol's
    /// `n_desc`. Flat namespace images always look symbols up globally.
    pub fn library_ordinal_from_desc(&self, n_desc: u16) -> i32 {
        if !self.is_two_level_namespace() {
            return BIND_SPECIAL_DYLIB_FLAT_LOOKUP;
        }
        match (n_desc >> 8) as u8 {
            SELF_LIBRARY_ORDINAL => BIND_SPECIAL_DYLIB_SELF,
            DYNAMIC_LOOKUP_ORDINAL => BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
            EXECUTABLE_ORDINAL => BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE,
            n => n as i32,
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A location that must be slid by the load address delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RebaseRecord {
    pub segment_index: u32,
    pub segment_offset: u64,
    /// Offset from the start of __TEXT
    pub runtime_offset: u64,
    pub kind: FixupKind,
}

/// A location that must be set to the address of a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindRecord<'a> {
    pub segment_index: u32,
    pub segment_offset: u64,
    /// Offset from the start of __TEXT
    pub runtime_offset: u64,
    pub kind: FixupKind,
    pub symbol_name: Cow<'a, str>,
    /// Raw library ordinal; see [`BindRecord::library`]
    pub ordinal: i32,
    pub addend: i64,
    pub weak_import: bool,
    /// Bound on first call through a stub rather than at load
    pub lazy: bool,
}

impl BindRecord<'_> {
    /// The decoded library ordinal.
    #[inline]
    pub fn library(&self) -> Option<LibraryOrdinal> {
        LibraryOrdinal::from_raw(self.ordinal)
    }

    /// Detaches the record from the image buffer.
    pub fn into_owned(self) -> BindRecord<'static> {
        BindRecord {
            segment_index: self.segment_index,
            segment_offset: self.segment_offset,
            runtime_offset: self.runtime_offset,
            kind: self.kind,
            symbol_name: Cow::Owned(self.symbol_name.into_owned()),
            ordinal: self.ordinal,
            addend: self.addend,
            weak_import: self.weak_import,
            lazy: self.lazy,
        }
    }
}

// =============================================================================
// Fixup Context
// =============================================================================

/// Accumulated state of a rebase or bind opcode machine at the moment it
/// emits a fixup.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixupLocation {
    pub segment_index: u32,
    pub segment_offset: u64,
    pub segment_set: bool,
}

/// Accumulated bind state at the moment a bind is emitted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BindTarget<'s> {
    pub symbol: Option<&'s str>,
    pub ordinal: i32,
    pub ordinal_set: bool,
    pub bind_type: u8,
}

/// Segment layout and image facts every fixup walker checks against.
pub(crate) struct FixupContext<'i, 'a> {
    pub image: &'i MachOImage<'a>,
    pub info: LinkEditInfo,
    pub pointer_size: u32,
    pub text_vm_addr: u64,
    pub dylib_count: u32,
    /// x86_64 kexts may carry text binds the loader would otherwise refuse
    pub allow_text_binds: bool,
}

impl<'i, 'a> FixupContext<'i, 'a> {
    pub fn new(image: &'i MachOImage<'a>) -> Result<Self> {
        let info = image.linkedit_info()?;
        let text_vm_addr = info.text_vm_addr();
        Ok(Self {
            image,
            info,
            pointer_size: image.pointer_size(),
            text_vm_addr,
            dylib_count: image.dependent_dylib_count(),
            allow_text_binds: image.is_kext_bundle() && image.cputype() == CPU_TYPE_X86_64,
        })
    }

    #[inline]
    pub fn is_64(&self) -> bool {
        self.pointer_size == 8
    }

    /// Offset of `segment_offset` within `segment_index` from __TEXT.
    pub fn runtime_offset(&self, segment_index: u32, segment_offset: u64) -> u64 {
        self.info
            .segments
            .get(segment_index as usize)
            .map(|s| s.vm_addr.wrapping_add(segment_offset).wrapping_sub(self.text_vm_addr))
            .unwrap_or(segment_offset)
    }

    /// Resolves a vm address to (segment index, offset) among the segments
    /// below __LINKEDIT.
    pub fn segment_and_offset(&self, addr: u64) -> Option<(u32, u64)> {
        self.info
            .segments
            .iter()
            .take(self.info.linkedit_index as usize)
            .find(|s| s.contains_vm_addr(addr))
            .map(|s| (s.index, addr - s.vm_addr))
    }

    /// Reads the pointer-sized value stored at a segment location. Locations
    /// in the zero-fill tail of a segment read as 0.
    pub fn content_at(&self, segment_index: u32, segment_offset: u64) -> u64 {
        let Some(seg) = self.info.segments.get(segment_index as usize) else {
            return 0;
        };
        if segment_offset >= seg.file_size {
            return 0;
        }
        let Some(at) = seg.file_offset.checked_add(segment_offset) else {
            return 0;
        };
        usize::try_from(at)
            .ok()
            .and_then(|at| get_pointer_le(self.image.data(), at, self.pointer_size))
            .unwrap_or(0)
    }

    /// Checks segment index and offset against the segment table.
    fn check_location(&self, op: &str, at: &FixupLocation, missing: &str) -> Result<&SegmentInfo> {
        if !at.segment_set {
            return Err(Error::MalformedFixup(format!("{} missing preceding {}", op, missing)));
        }
        let Some(seg) = self.info.fixup_segment(at.segment_index) else {
            return Err(Error::MalformedFixup(format!(
                "{} segment index {} too large",
                op, at.segment_index
            )));
        };
        let ptr = self.pointer_size as u64;
        if seg.vm_size < ptr || at.segment_offset > seg.vm_size - ptr {
            return Err(Error::MalformedFixup(format!(
                "{} current segment offset 0x{:08X} beyond segment size (0x{:08X})",
                op, at.segment_offset, seg.vm_size
            )));
        }
        Ok(seg)
    }

    /// Validates a rebase about to be emitted.
    pub fn check_rebase(&self, op: &str, at: &FixupLocation, kind: FixupKind) -> Result<()> {
        let seg = self.check_location(op, at, "REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB")?;
        let fail = |msg: &str| Err(Error::MalformedFixup(format!("{} {}", op, msg)));
        match kind {
            FixupKind::Pointer32 | FixupKind::Pointer64 => {
                if !seg.writable() && self.image.enforce_format(FormatRule::WritableData) {
                    return fail("pointer rebase is in non-writable segment");
                }
                if seg.executable() && self.image.enforce_format(FormatRule::ExecutableData) {
                    return fail("pointer rebase is in executable segment");
                }
            }
            FixupKind::TextAbsolute32 | FixupKind::TextPcRel32 => {
                if !seg.text_relocs {
                    return fail("text rebase is in segment that does not support text relocations");
                }
                if seg.writable() {
                    return fail("text rebase is in writable segment");
                }
                if !seg.executable() {
                    return fail("pointer rebase is in non-executable segment");
                }
            }
            FixupKind::Unknown(_) => return fail("unknown rebase type"),
        }
        Ok(())
    }

    /// Validates a bind about to be emitted.
    pub fn check_bind(&self, op: &str, at: &FixupLocation, target: &BindTarget<'_>) -> Result<()> {
        let seg = self.check_location(op, at, "BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB")?;
        let fail = |msg: String| Err(Error::MalformedFixup(format!("{} {}", op, msg)));
        if target.symbol.is_none() {
            return fail("missing preceding BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM".into());
        }
        if !target.ordinal_set {
            return fail("missing preceding BIND_OPCODE_SET_DYLIB_ORDINAL".into());
        }
        if target.ordinal > self.dylib_count as i32 {
            return fail(format!(
                "has library ordinal too large ({}) max ({})",
                target.ordinal, self.dylib_count
            ));
        }
        if target.ordinal < BIND_SPECIAL_DYLIB_WEAK_LOOKUP {
            return fail(format!("has unknown library special ordinal ({})", target.ordinal));
        }
        match target.bind_type {
            BIND_TYPE_POINTER => {
                if !seg.writable() {
                    return fail("pointer bind is in non-writable segment".into());
                }
                if seg.executable() && self.image.enforce_format(FormatRule::ExecutableData) {
                    return fail("pointer bind is in executable segment".into());
                }
            }
            BIND_TYPE_TEXT_ABSOLUTE32 | BIND_TYPE_TEXT_PCREL32 => {
                if !seg.text_relocs && !self.allow_text_binds {
                    return fail("text bind is in segment that does not support text relocations".into());
                }
                if seg.writable() {
                    return fail("text bind is in writable segment".into());
                }
                if !seg.executable() {
                    return fail("pointer bind is in non-executable segment".into());
                }
            }
            other => return fail(format!("unknown bind type {}", other)),
        }
        Ok(())
    }
}
