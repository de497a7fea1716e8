//! Metadata accessors for validated images.
//!
//! Install name, dependents, rpaths, UUID, entry point, code signature,
//! initializers and terminators, Objective-C image info and function starts.
//! These read load commands and sections that validation has already
//! bounds checked, but still never index outside the file.

use std::borrow::Cow;
use std::ops::ControlFlow;

use tracing::debug;

use crate::diag::Diagnostics;
use crate::dyld::{ChainedFixup, ChainedPointer};
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{get_pointer_le, get_u32_le, read_uleb128, sub_slice};

/// Set in `__objc_imageinfo` flags by the shared cache builder.
pub const OBJC_IMAGE_DYLD_PREOPTIMIZED: u32 = 1 << 7;

// =============================================================================
// Dylibs
// =============================================================================

/// How a dependent dylib is linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependentKind {
    Regular,
    Weak,
    Reexport,
    Upward,
}

impl DependentKind {
    fn from_cmd(cmd: u32) -> Option<Self> {
        match cmd {
            LC_LOAD_DYLIB => Some(DependentKind::Regular),
            LC_LOAD_WEAK_DYLIB => Some(DependentKind::Weak),
            LC_REEXPORT_DYLIB => Some(DependentKind::Reexport),
            LC_LOAD_UPWARD_DYLIB => Some(DependentKind::Upward),
            _ => None,
        }
    }
}

/// A dylib load command: LC_ID_DYLIB or one of the dependent kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibRef<'a> {
    pub path: Cow<'a, str>,
    pub current_version: u32,
    pub compatibility_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentDylib<'a> {
    pub dylib: DylibRef<'a>,
    pub kind: DependentKind,
}

/// Entry point as an offset from the start of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub offset: u64,
    /// LC_UNIXTHREAD: the entry is crt1's `start`, not `main`
    pub uses_crt: bool,
}

/// The `__objc_imageinfo` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjcImageInfo {
    pub version: u32,
    pub flags: u32,
}

fn dylib_ref<'a>(cmd: &LoadCommandRef<'a>) -> Option<DylibRef<'a>> {
    let dylib = cmd.read::<DylibCommand>()?;
    let path = cmd.cstr_at(dylib.name_offset)?;
    Some(DylibRef {
        path: String::from_utf8_lossy(path),
        current_version: dylib.current_version,
        compatibility_version: dylib.compatibility_version,
    })
}

// =============================================================================
// VM Address Conversion
// =============================================================================

/// Turns pointer-sized values read from the file into vm addresses. Images
/// with chained fixups store rebases in the chain encoding, so those are
/// decoded first.
#[derive(Debug, Clone, Copy)]
pub struct VmAddrConverter {
    pub preferred_load_address: u64,
    /// 0 when the image has no chained fixups
    pub chained_pointer_format: u16,
}

impl VmAddrConverter {
    pub fn convert(&self, value: u64) -> u64 {
        if self.chained_pointer_format == 0 {
            return value;
        }
        let Some((pointer, _)) = ChainedPointer::decode(self.chained_pointer_format, value, 0) else {
            return value;
        };
        let fixup = ChainedFixup {
            segment_index: 0,
            segment_offset: 0,
            pointer_format: self.chained_pointer_format,
            raw: value,
            pointer,
        };
        match fixup.rebase_runtime_offset(self.preferred_load_address) {
            Some(offset) => self.preferred_load_address.wrapping_add(offset),
            None => value,
        }
    }
}

/// Half-open vm ranges of the executable segments.
struct ExecutableRanges(Vec<(u64, u64)>);

impl ExecutableRanges {
    fn of(image: &MachOImage<'_>) -> Result<Self> {
        let ranges: Vec<_> = image
            .segments()
            .iter()
            .filter(|s| s.executable())
            .map(|s| (s.vm_addr, s.vm_addr.saturating_add(s.vm_size)))
            .collect();
        if ranges.is_empty() {
            return Err(Error::MalformedMetadata("no executable segments".into()));
        }
        Ok(Self(ranges))
    }

    fn contains(&self, addr: u64) -> bool {
        self.0.iter().any(|&(start, end)| start <= addr && addr < end)
    }
}

// =============================================================================
// Accessors
// =============================================================================

impl<'a> MachOImage<'a> {
    fn valid_load_commands(&self) -> impl Iterator<Item = LoadCommandRef<'a>> {
        self.load_commands().map_while(|cmd| cmd.ok())
    }

    /// LC_ID_DYLIB of a dylib.
    pub fn install_name(&self) -> Option<DylibRef<'a>> {
        self.valid_load_commands()
            .find(|cmd| cmd.cmd == LC_ID_DYLIB)
            .and_then(|cmd| dylib_ref(&cmd))
    }

    /// Number of LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_REEXPORT_DYLIB and
    /// LC_LOAD_UPWARD_DYLIB commands. Library ordinals range up to this.
    pub fn dependent_dylib_count(&self) -> u32 {
        self.valid_load_commands()
            .filter(|cmd| DependentKind::from_cmd(cmd.cmd).is_some())
            .count() as u32
    }

    /// Calls `f` for each dependent dylib in ordinal order.
    pub fn for_each_dependent_dylib<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(&DependentDylib<'a>) -> ControlFlow<()>,
    {
        for cmd in self.load_commands() {
            let cmd = match cmd {
                Ok(cmd) => cmd,
                Err(err) => {
                    diag.error(err);
                    return;
                }
            };
            let Some(kind) = DependentKind::from_cmd(cmd.cmd) else {
                continue;
            };
            let Some(dylib) = dylib_ref(&cmd) else {
                diag.error(Error::MalformedLoadCommands(format!(
                    "load command #{} string extends beyond end of load command",
                    cmd.index + 1
                )));
                return;
            };
            if f(&DependentDylib { dylib, kind }).is_break() {
                return;
            }
        }
    }

    pub fn dependent_dylibs(&self, diag: &mut Diagnostics) -> Vec<DependentDylib<'a>> {
        let mut out = Vec::new();
        self.for_each_dependent_dylib(diag, |dylib| {
            out.push(dylib.clone());
            ControlFlow::Continue(())
        });
        out
    }

    pub fn rpaths(&self) -> Vec<Cow<'a, str>> {
        self.valid_load_commands()
            .filter(|cmd| cmd.cmd == LC_RPATH)
            .filter_map(|cmd| {
                let rpath = cmd.read::<RpathCommand>()?;
                cmd.cstr_at(rpath.path_offset).map(String::from_utf8_lossy)
            })
            .collect()
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.valid_load_commands()
            .find(|cmd| cmd.cmd == LC_UUID)
            .and_then(|cmd| cmd.read::<UuidCommand>())
            .map(|cmd| cmd.uuid)
    }

    /// File range of the code signature as (offset, size). macOS x86
    /// binaries built with pre-10.9 tools carry signatures nothing checks,
    /// so those report none.
    pub fn code_signature(&self) -> Option<(u32, u32)> {
        let cmd = self
            .valid_load_commands()
            .find(|cmd| cmd.cmd == LC_CODE_SIGNATURE)
            .and_then(|cmd| cmd.read::<LinkeditDataCommand>())?;
        if cmd.dataoff == 0 {
            return None;
        }
        if matches!(self.cputype(), CPU_TYPE_X86_64 | CPU_TYPE_I386) {
            let platforms = self.supported_platforms();
            let old_sdk = platforms
                .iter()
                .any(|p| p.platform == Platform::MacOS && p.sdk < 0x000A_0900);
            if platforms.is_empty() || old_sdk {
                debug!("ignoring code signature of pre-10.9 binary");
                return None;
            }
        }
        Some((cmd.dataoff, cmd.datasize))
    }

    /// LC_MAIN or LC_UNIXTHREAD, whichever comes first. `None` if neither
    /// yields a non-zero offset.
    pub fn entry(&self) -> Option<EntryPoint> {
        let entry = self.valid_load_commands().find_map(|cmd| match cmd.cmd {
            LC_MAIN => cmd.read::<EntryPointCommand>().map(|main| EntryPoint {
                offset: main.entryoff,
                uses_crt: false,
            }),
            LC_UNIXTHREAD => Some(EntryPoint {
                offset: self
                    .entry_addr_from_thread_cmd(&cmd)
                    .wrapping_sub(self.preferred_load_address()),
                uses_crt: true,
            }),
            _ => None,
        })?;
        (entry.offset != 0).then_some(entry)
    }

    /// Converter for pointers stored in this image's data segments.
    pub fn vm_addr_converter(&self, diag: &mut Diagnostics) -> VmAddrConverter {
        let mut chained_pointer_format = 0;
        if self.has_chained_fixups() {
            chained_pointer_format = self
                .chain_starts(diag)
                .and_then(|starts| starts.segments.first().map(|s| s.pointer_format))
                .unwrap_or(DYLD_CHAINED_PTR_ARM64E);
        }
        VmAddrConverter {
            preferred_load_address: self.preferred_load_address(),
            chained_pointer_format,
        }
    }

    fn section_content(&self, sect: &SectionInfo) -> Option<&'a [u8]> {
        sub_slice(self.data(), sect.file_offset as u64, sect.size)
    }

    /// Pointer-sized values of a function pointer section, converted to vm
    /// addresses.
    fn function_pointers(&self, what: &str, sect: &SectionInfo, converter: &VmAddrConverter) -> Result<Vec<u64>> {
        let pointer_size = self.pointer_size();
        let name = format!("{}/{}", sect.segment_name, sect.name);
        if sect.size % pointer_size as u64 != 0 {
            return Err(Error::MalformedMetadata(format!("{} section {} has bad size", what, name)));
        }
        let content = match self.section_content(sect) {
            Some(content) if !sect.malformed_range => content,
            _ => {
                return Err(Error::MalformedMetadata(format!(
                    "{} section {} extends beyond its segment",
                    what, name
                )))
            }
        };
        if sect.addr % pointer_size as u64 != 0 {
            return Err(Error::MalformedMetadata(format!(
                "{} section {} is not pointer aligned",
                what, name
            )));
        }
        Ok((0..content.len())
            .step_by(pointer_size as usize)
            .filter_map(|at| get_pointer_le(content, at, pointer_size))
            .map(|value| converter.convert(value))
            .collect())
    }

    fn walk_initializers<F>(&self, converter: &VmAddrConverter, f: &mut F) -> Result<()>
    where
        F: FnMut(u32) -> ControlFlow<()>,
    {
        let executable = ExecutableRanges::of(self)?;
        let base = self.preferred_load_address();

        // a dylib linked with -init runs that first
        for cmd in self.valid_load_commands() {
            let init = match cmd.cmd {
                LC_ROUTINES => cmd.read::<RoutinesCommand>().map(|r| r.init_address as u64),
                LC_ROUTINES_64 => cmd.read::<RoutinesCommand64>().map(|r| r.init_address),
                _ => None,
            };
            let Some(init) = init else { continue };
            if !executable.contains(init) {
                return Err(Error::MalformedMetadata(
                    "-init does not point within __TEXT segment".into(),
                ));
            }
            if f(init.wrapping_sub(base) as u32).is_break() {
                return Ok(());
            }
        }

        let sections = self.sections();
        for sect in sections.iter().filter(|s| s.section_type() == S_MOD_INIT_FUNC_POINTERS) {
            for init in self.function_pointers("initializer", sect, converter)? {
                if !executable.contains(init) {
                    return Err(Error::MalformedMetadata(format!(
                        "initializer 0x{:X} does not point within executable segment",
                        init
                    )));
                }
                if f(init.wrapping_sub(base) as u32).is_break() {
                    return Ok(());
                }
            }
        }

        let segments = self.segments();
        for sect in sections.iter().filter(|s| s.section_type() == S_INIT_FUNC_OFFSETS) {
            let name = format!("{}/{}", sect.segment_name, sect.name);
            let fail = |msg: &str| Err(Error::MalformedMetadata(format!("initializer offsets section {} {}", name, msg)));
            if segments.get(sect.segment_index as usize).is_some_and(|s| s.writable()) {
                return fail("must be in read-only segment");
            }
            if sect.size % 4 != 0 {
                return fail("has bad size");
            }
            let content = match self.section_content(sect) {
                Some(content) if !sect.malformed_range => content,
                _ => return fail("extends beyond the end of the segment"),
            };
            if sect.addr % 4 != 0 {
                return fail("is not 4-byte aligned");
            }
            for at in (0..content.len()).step_by(4) {
                let Some(offset) = get_u32_le(content, at) else { break };
                if !executable.contains(base.wrapping_add(offset as u64)) {
                    return Err(Error::MalformedMetadata(format!(
                        "initializer 0x{:08X} is not an offset to an executable segment",
                        offset
                    )));
                }
                if f(offset).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Calls `f` with the image offset of each initializer, in run order:
    /// the `-init` routine, then `__mod_init_func` pointers, then
    /// `__init_offsets` entries.
    pub fn for_each_initializer<F>(&self, diag: &mut Diagnostics, converter: &VmAddrConverter, mut f: F)
    where
        F: FnMut(u32) -> ControlFlow<()>,
    {
        if let Err(err) = self.walk_initializers(converter, &mut f) {
            diag.error(err);
        }
    }

    pub fn initializers(&self, diag: &mut Diagnostics) -> Vec<u32> {
        let converter = self.vm_addr_converter(diag);
        let mut out = Vec::new();
        self.for_each_initializer(diag, &converter, |offset| {
            out.push(offset);
            ControlFlow::Continue(())
        });
        out
    }

    /// Calls `f` with the image offset of each `__mod_term_func` pointer.
    pub fn for_each_terminator<F>(&self, diag: &mut Diagnostics, converter: &VmAddrConverter, mut f: F)
    where
        F: FnMut(u32) -> ControlFlow<()>,
    {
        let mut walk = || -> Result<()> {
            let executable = ExecutableRanges::of(self)?;
            let base = self.preferred_load_address();
            for sect in self.sections().iter().filter(|s| s.section_type() == S_MOD_TERM_FUNC_POINTERS) {
                for term in self.function_pointers("terminator", sect, converter)? {
                    if !executable.contains(term) {
                        return Err(Error::MalformedMetadata(format!(
                            "terminator 0x{:X} does not point within executable segment",
                            term
                        )));
                    }
                    if f(term.wrapping_sub(base) as u32).is_break() {
                        return Ok(());
                    }
                }
            }
            Ok(())
        };
        if let Err(err) = walk() {
            diag.error(err);
        }
    }

    pub fn terminators(&self, diag: &mut Diagnostics) -> Vec<u32> {
        let converter = self.vm_addr_converter(diag);
        let mut out = Vec::new();
        self.for_each_terminator(diag, &converter, |offset| {
            out.push(offset);
            ControlFlow::Continue(())
        });
        out
    }

    // -------------------------------------------------------------------------
    // Objective-C
    // -------------------------------------------------------------------------

    fn is_objc_data_segment(name: &str) -> bool {
        name.starts_with("__DATA")
    }

    pub fn has_objc(&self) -> bool {
        let intel32 = self.cputype() == CPU_TYPE_I386;
        self.sections().iter().any(|s| {
            (s.name == "__objc_imageinfo" && Self::is_objc_data_segment(&s.segment_name))
                || (intel32 && s.name == "__image_info" && s.segment_name == "__OBJC")
        })
    }

    /// The `__objc_imageinfo` section, unless it is malformed or was already
    /// optimized into a shared cache.
    pub fn objc_image_info(&self) -> Option<ObjcImageInfo> {
        let sect = self
            .sections()
            .into_iter()
            .find(|s| s.name == "__objc_imageinfo" && Self::is_objc_data_segment(&s.segment_name))?;
        if sect.malformed_range || sect.size != 8 {
            return None;
        }
        let content = self.section_content(&sect)?;
        let info = ObjcImageInfo {
            version: get_u32_le(content, 0)?,
            flags: get_u32_le(content, 4)?,
        };
        if info.flags & OBJC_IMAGE_DYLD_PREOPTIMIZED != 0 {
            return None;
        }
        Some(info)
    }

    /// Calls `f` with (slot vm address, target vm address) for each pointer
    /// in the named `__DATA*` section.
    pub fn for_each_objc_pointer<F>(&self, diag: &mut Diagnostics, section: &str, mut f: F)
    where
        F: FnMut(u64, u64) -> ControlFlow<()>,
    {
        let converter = self.vm_addr_converter(diag);
        let pointer_size = self.pointer_size() as u64;
        for sect in self.sections() {
            if sect.name != section || !Self::is_objc_data_segment(&sect.segment_name) {
                continue;
            }
            if sect.size % pointer_size != 0 {
                diag.error(Error::MalformedMetadata(format!("Invalid {} section size", section)));
                return;
            }
            let Some(content) = self.section_content(&sect).filter(|_| !sect.malformed_range) else {
                diag.error(Error::MalformedMetadata(format!(
                    "{} section {} extends beyond its segment",
                    section,
                    sect.full_name()
                )));
                return;
            };
            for at in (0..sect.size).step_by(pointer_size as usize) {
                let Some(value) = get_pointer_le(content, at as usize, pointer_size as u32) else {
                    break;
                };
                if f(sect.addr + at, converter.convert(value)).is_break() {
                    return;
                }
            }
        }
    }

    fn objc_targets(&self, diag: &mut Diagnostics, section: &str) -> Vec<u64> {
        let mut out = Vec::new();
        self.for_each_objc_pointer(diag, section, |_, target| {
            out.push(target);
            ControlFlow::Continue(())
        });
        out
    }

    /// Class pointers from `__objc_classlist`.
    pub fn objc_classes(&self, diag: &mut Diagnostics) -> Vec<u64> {
        self.objc_targets(diag, "__objc_classlist")
    }

    /// Selector string addresses from `__objc_selrefs`.
    pub fn objc_selector_references(&self, diag: &mut Diagnostics) -> Vec<u64> {
        self.objc_targets(diag, "__objc_selrefs")
    }

    /// Protocol pointers from `__objc_protolist`.
    pub fn objc_protocols(&self, diag: &mut Diagnostics) -> Vec<u64> {
        self.objc_targets(diag, "__objc_protolist")
    }

    // -------------------------------------------------------------------------
    // Function starts
    // -------------------------------------------------------------------------

    /// Image offsets of every function start in LC_FUNCTION_STARTS.
    pub fn function_starts(&self, diag: &mut Diagnostics) -> Vec<u64> {
        let mut out = Vec::new();
        let mut walk = || -> Result<()> {
            let info = self.linkedit_info()?;
            let Some(cmd) = info.function_starts else {
                return Ok(());
            };
            let blob = self.linkedit_blob("function starts", cmd.dataoff, cmd.datasize as u64)?;
            let mut addr = info.text_vm_addr().wrapping_sub(self.preferred_load_address());
            let mut p = 0;
            while p < blob.len() {
                let delta = read_uleb128(blob, &mut p, blob.len())
                    .map_err(|e| Error::MalformedMetadata(format!("function starts: {}", e)))?;
                if delta == 0 {
                    break;
                }
                addr = addr.wrapping_add(delta);
                out.push(addr);
            }
            Ok(())
        };
        if let Err(err) = walk() {
            diag.error(err);
        }
        out
    }
}
