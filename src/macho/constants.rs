//! Mach-O constants and flags.
//!
//! Values here are part of the on-disk format and must stay bit-exact.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// 32-bit Mach-O magic (big-endian)
pub const MH_CIGAM: u32 = 0xCEFAEDFE;

/// FAT binary magic (stored big-endian)
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

/// FAT binary magic with 64-bit offsets (stored big-endian)
pub const FAT_MAGIC_64: u32 = 0xCAFEBABF;

// =============================================================================
// File Types
// =============================================================================

/// Object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Preloaded executable
pub const MH_PRELOAD: u32 = 0x5;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Dynamic link editor
pub const MH_DYLINKER: u32 = 0x7;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;
/// Debug symbols file
pub const MH_DSYM: u32 = 0xA;
/// Kernel extension bundle
pub const MH_KEXT_BUNDLE: u32 = 0xB;
/// File set (kernel collection)
pub const MH_FILESET: u32 = 0xC;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// ILP32 on a 64-bit architecture
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
/// ARM64_32 CPU type
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// i386 is the same value as x86
pub const CPU_TYPE_I386: u32 = CPU_TYPE_X86;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

// =============================================================================
// CPU Subtypes
// =============================================================================

/// Capability bits in the high byte of a subtype
pub const CPU_SUBTYPE_MASK: u32 = 0xFF00_0000;
/// Pointer authentication ABI versioned subtype
pub const CPU_SUBTYPE_PTRAUTH_ABI: u32 = 0x8000_0000;

/// ARM64 all
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// ARM64 v8
pub const CPU_SUBTYPE_ARM64_V8: u32 = 1;
/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;
/// ARM64_32 v8
pub const CPU_SUBTYPE_ARM64_32_V8: u32 = 1;

/// ARM v7
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;
/// ARM v7s
pub const CPU_SUBTYPE_ARM_V7S: u32 = 11;
/// ARM v7k
pub const CPU_SUBTYPE_ARM_V7K: u32 = 12;

/// i386 all
pub const CPU_SUBTYPE_I386_ALL: u32 = 3;
/// x86_64 all
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
/// x86_64 Haswell
pub const CPU_SUBTYPE_X86_64_H: u32 = 8;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Segment of this file
pub const LC_SEGMENT: u32 = 0x1;
/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Thread
pub const LC_THREAD: u32 = 0x4;
/// Unix thread
pub const LC_UNIXTHREAD: u32 = 0x5;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// Dynamic linker identification
pub const LC_ID_DYLINKER: u32 = 0xF;
/// Image routines
pub const LC_ROUTINES: u32 = 0x11;
/// Load a dynamically linked shared library, allowed to be missing
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// 64-bit image routines
pub const LC_ROUTINES_64: u32 = 0x1A;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Runpath additions
pub const LC_RPATH: u32 = 0x1C | LC_REQ_DYLD;
/// Code signature
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Split segment info
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
/// Re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Encrypted segment info
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// Minimum macOS version
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
/// Minimum iOS version
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
/// Function starts
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Dyld environment
pub const LC_DYLD_ENVIRONMENT: u32 = 0x27;
/// Main entry point
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// Data in code
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// Source version
pub const LC_SOURCE_VERSION: u32 = 0x2A;
/// Code signing DRs
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2B;
/// 64-bit encrypted segment info
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2C;
/// Linker options
pub const LC_LINKER_OPTION: u32 = 0x2D;
/// Linker optimization hints
pub const LC_LINKER_OPTIMIZATION_HINT: u32 = 0x2E;
/// Minimum tvOS version
pub const LC_VERSION_MIN_TVOS: u32 = 0x2F;
/// Minimum watchOS version
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
/// Build version
pub const LC_BUILD_VERSION: u32 = 0x32;
/// Exports trie
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Chained fixups
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;
/// File set entry
pub const LC_FILESET_ENTRY: u32 = 0x35 | LC_REQ_DYLD;

/// Returns a human readable name for a load command kind.
pub fn load_command_name(cmd: u32) -> &'static str {
    match cmd {
        LC_SEGMENT => "LC_SEGMENT",
        LC_SYMTAB => "LC_SYMTAB",
        LC_THREAD => "LC_THREAD",
        LC_UNIXTHREAD => "LC_UNIXTHREAD",
        LC_DYSYMTAB => "LC_DYSYMTAB",
        LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
        LC_ID_DYLINKER => "LC_ID_DYLINKER",
        LC_ROUTINES => "LC_ROUTINES",
        LC_LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_ROUTINES_64 => "LC_ROUTINES_64",
        LC_UUID => "LC_UUID",
        LC_RPATH => "LC_RPATH",
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_SEGMENT_SPLIT_INFO => "LC_SEGMENT_SPLIT_INFO",
        LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
        LC_ENCRYPTION_INFO => "LC_ENCRYPTION_INFO",
        LC_DYLD_INFO => "LC_DYLD_INFO",
        LC_DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
        LC_LOAD_UPWARD_DYLIB => "LC_LOAD_UPWARD_DYLIB",
        LC_VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
        LC_VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
        LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
        LC_DYLD_ENVIRONMENT => "LC_DYLD_ENVIRONMENT",
        LC_MAIN => "LC_MAIN",
        LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
        LC_SOURCE_VERSION => "LC_SOURCE_VERSION",
        LC_DYLIB_CODE_SIGN_DRS => "LC_DYLIB_CODE_SIGN_DRS",
        LC_ENCRYPTION_INFO_64 => "LC_ENCRYPTION_INFO_64",
        LC_LINKER_OPTION => "LC_LINKER_OPTION",
        LC_LINKER_OPTIMIZATION_HINT => "LC_LINKER_OPTIMIZATION_HINT",
        LC_VERSION_MIN_TVOS => "LC_VERSION_MIN_TVOS",
        LC_VERSION_MIN_WATCHOS => "LC_VERSION_MIN_WATCHOS",
        LC_BUILD_VERSION => "LC_BUILD_VERSION",
        LC_DYLD_EXPORTS_TRIE => "LC_DYLD_EXPORTS_TRIE",
        LC_DYLD_CHAINED_FIXUPS => "LC_DYLD_CHAINED_FIXUPS",
        LC_FILESET_ENTRY => "LC_FILESET_ENTRY",
        _ => "LC_UNKNOWN",
    }
}

// =============================================================================
// Memory Protection
// =============================================================================

/// Read permission
pub const VM_PROT_READ: u32 = 0x1;
/// Write permission
pub const VM_PROT_WRITE: u32 = 0x2;
/// Execute permission
pub const VM_PROT_EXECUTE: u32 = 0x4;
/// Bits that must never be set in a segment protection
pub const VM_PROT_INVALID_BITS: u32 = 0xFFFF_FFF8;

// =============================================================================
// Segment Flags
// =============================================================================

/// Segment has nothing allocated in it and nothing relocated to it
pub const SG_NORELOC: u32 = 0x4;

// =============================================================================
// Section Types and Attributes
// =============================================================================

/// Section type mask
pub const SECTION_TYPE: u32 = 0x0000_00FF;
/// Section attributes mask
pub const SECTION_ATTRIBUTES: u32 = 0xFFFF_FF00;

/// Regular section
pub const S_REGULAR: u32 = 0x0;
/// Zero fill on demand
pub const S_ZEROFILL: u32 = 0x1;
/// Literal C strings
pub const S_CSTRING_LITERALS: u32 = 0x2;
/// Non-lazy symbol pointers
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
/// Lazy symbol pointers
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
/// Symbol stubs
pub const S_SYMBOL_STUBS: u32 = 0x8;
/// Module init function pointers
pub const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
/// Module term function pointers
pub const S_MOD_TERM_FUNC_POINTERS: u32 = 0xA;
/// Interposing
pub const S_INTERPOSING: u32 = 0xD;
/// Zero fill larger than 4GB
pub const S_GB_ZEROFILL: u32 = 0xC;
/// Thread local zerofill
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;
/// 32-bit offsets to initializers
pub const S_INIT_FUNC_OFFSETS: u32 = 0x16;

/// Section contains only machine instructions
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
/// Section contains self-modifying code
pub const S_ATTR_SELF_MODIFYING_CODE: u32 = 0x0400_0000;
/// Section contains some machine instructions
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;
/// Section has external relocation entries
pub const S_ATTR_EXT_RELOC: u32 = 0x0000_0200;
/// Section has local relocation entries
pub const S_ATTR_LOC_RELOC: u32 = 0x0000_0100;

// =============================================================================
// Symbol Table
// =============================================================================

/// Mask for the type bits of n_type
pub const N_TYPE: u8 = 0x0E;
/// External symbol
pub const N_EXT: u8 = 0x01;
/// Defined in section
pub const N_SECT: u8 = 0x0E;
/// Undefined symbol
pub const N_UNDF: u8 = 0x00;

/// Weak reference
pub const N_WEAK_REF: u16 = 0x0040;
/// Weak definition
pub const N_WEAK_DEF: u16 = 0x0080;

/// Library ordinal referring to the image itself
pub const SELF_LIBRARY_ORDINAL: u8 = 0x0;
/// Library ordinal for dynamic (flat) lookup
pub const DYNAMIC_LOOKUP_ORDINAL: u8 = 0xFE;
/// Library ordinal referring to the main executable
pub const EXECUTABLE_ORDINAL: u8 = 0xFF;

/// Extracts the library ordinal byte from an n_desc value.
#[inline]
pub const fn get_library_ordinal(n_desc: u16) -> u8 {
    ((n_desc >> 8) & 0xFF) as u8
}

/// Indirect symbol refers to a local (rebased) pointer
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
/// Indirect symbol is absolute
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

// =============================================================================
// Rebase Opcodes
// =============================================================================

/// Rebase opcode mask (high nibble)
pub const REBASE_OPCODE_MASK: u8 = 0xF0;
/// Rebase immediate mask (low nibble)
pub const REBASE_IMMEDIATE_MASK: u8 = 0x0F;

/// Pointer rebase
pub const REBASE_TYPE_POINTER: u8 = 1;
/// 32-bit absolute text rebase
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
/// 32-bit pc-relative text rebase
pub const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

#[allow(missing_docs)]
pub const REBASE_OPCODE_DONE: u8 = 0x00;
#[allow(missing_docs)]
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
#[allow(missing_docs)]
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
#[allow(missing_docs)]
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
#[allow(missing_docs)]
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
#[allow(missing_docs)]
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
#[allow(missing_docs)]
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
#[allow(missing_docs)]
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
#[allow(missing_docs)]
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

// =============================================================================
// Bind Opcodes
// =============================================================================

/// Bind opcode mask (high nibble)
pub const BIND_OPCODE_MASK: u8 = 0xF0;
/// Bind immediate mask (low nibble)
pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;

/// Pointer bind
pub const BIND_TYPE_POINTER: u8 = 1;
/// 32-bit absolute text bind
pub const BIND_TYPE_TEXT_ABSOLUTE32: u8 = 2;
/// 32-bit pc-relative text bind
pub const BIND_TYPE_TEXT_PCREL32: u8 = 3;

/// Bind to the image itself
pub const BIND_SPECIAL_DYLIB_SELF: i32 = 0;
/// Bind to the main executable
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i32 = -1;
/// Bind with flat namespace lookup
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i32 = -2;
/// Bind with weak coalescing lookup
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i32 = -3;

/// Symbol is a weak import
pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;
/// Weak-bind symbol is a strong (non-weak) definition
pub const BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION: u8 = 0x8;

#[allow(missing_docs)]
pub const BIND_OPCODE_DONE: u8 = 0x00;
#[allow(missing_docs)]
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
#[allow(missing_docs)]
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
#[allow(missing_docs)]
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
#[allow(missing_docs)]
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
#[allow(missing_docs)]
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
#[allow(missing_docs)]
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
#[allow(missing_docs)]
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
#[allow(missing_docs)]
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
#[allow(missing_docs)]
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
#[allow(missing_docs)]
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
#[allow(missing_docs)]
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
#[allow(missing_docs)]
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
#[allow(missing_docs)]
pub const BIND_OPCODE_THREADED: u8 = 0xD0;

/// Threaded sub-opcode declaring the target table size
pub const BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB: u8 = 0x00;
/// Threaded sub-opcode starting a chain at the current location
pub const BIND_SUBOPCODE_THREADED_APPLY: u8 = 0x01;

// =============================================================================
// Relocations
// =============================================================================

/// GENERIC_RELOC_VANILLA, X86_64_RELOC_UNSIGNED and ARM64_RELOC_UNSIGNED
pub const RELOC_UNSIGNED: u8 = 0;
/// x86_64 call or jump target
pub const X86_64_RELOC_BRANCH: u8 = 2;

// =============================================================================
// Chained Fixups
// =============================================================================

/// Page has no fixups
pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;
/// Page start is an index into the overflow chain starts
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;
/// Last chain start for a page
pub const DYLD_CHAINED_PTR_START_LAST: u16 = 0x8000;

/// Imports are `dyld_chained_import`
pub const DYLD_CHAINED_IMPORT: u32 = 1;
/// Imports are `dyld_chained_import_addend`
pub const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
/// Imports are `dyld_chained_import_addend64`
pub const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_64: u16 = 2;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_32: u16 = 3;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_32_CACHE: u16 = 4;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_32_FIRMWARE: u16 = 5;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_ARM64E_KERNEL: u16 = 7;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_64_KERNEL_CACHE: u16 = 8;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND: u16 = 9;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_ARM64E_FIRMWARE: u16 = 10;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE: u16 = 11;
#[allow(missing_docs)]
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;

/// Highest defined pointer format
pub const DYLD_CHAINED_PTR_MAX: u16 = DYLD_CHAINED_PTR_ARM64E_USERLAND24;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The image is using two-level namespace bindings
        const TWOLEVEL = 0x80;
        /// The final linked image contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// The OS will load the main executable at a random address
        const PIE = 0x200000;
        /// The image contains thread-local variables
        const HAS_TLV_DESCRIPTORS = 0x800000;
        /// The code was linked for use in an application extension
        const APP_EXTENSION_SAFE = 0x02000000;
        /// The image is part of the dyld shared cache
        const DYLIB_IN_CACHE = 0x80000000;
    }
}
