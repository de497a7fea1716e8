//! Structural validation of a Mach-O image.
//!
//! Validation runs in two phases. [`validate`] checks everything up to and
//! including the entry point. [`ValidatedImage::validate_linkedit`] checks
//! the LINKEDIT layout and every fixup stream; it is separate so a loader
//! can remap the image between the two.

use std::ops::ControlFlow;

use bitflags::bitflags;
use tracing::debug;

use super::enforce::FormatRule;
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{get_u32_le, greater_than_add_or_overflow};

bitflags! {
    /// File types a caller is willing to accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileTypes: u32 {
        const EXECUTE = 1 << 0;
        const DYLIB = 1 << 1;
        const BUNDLE = 1 << 2;
        const DYLINKER = 1 << 3;
        const KEXT_BUNDLE = 1 << 4;
        const FILESET = 1 << 5;
    }
}

impl FileTypes {
    /// What a dynamic loader maps.
    pub const LOADABLE: Self = Self::EXECUTE.union(Self::DYLIB).union(Self::BUNDLE);

    /// Maps an `MH_*` file type to its flag.
    pub fn from_filetype(filetype: u32) -> Option<Self> {
        match filetype {
            MH_EXECUTE => Some(Self::EXECUTE),
            MH_DYLIB => Some(Self::DYLIB),
            MH_BUNDLE => Some(Self::BUNDLE),
            MH_DYLINKER => Some(Self::DYLINKER),
            MH_KEXT_BUNDLE => Some(Self::KEXT_BUNDLE),
            MH_FILESET => Some(Self::FILESET),
            _ => None,
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// What the caller expects of an image.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Acceptable architectures
    pub archs: GradedArchs,
    /// Platform of the process the image is for; `Unknown` asks for none
    pub platform: Platform,
    /// Acceptable file types
    pub file_types: FileTypes,
    /// Accept executables with no LC_LOAD_DYLINKER
    pub allow_static: bool,
    /// The image is signed as part of the OS
    pub is_os_binary: bool,
    /// Inspection-tool mode: kernel collection platform rules apply and
    /// an `Unknown` platform request means the image must declare none
    pub offline: bool,
    /// Verbosity for the diagnostics of each run
    pub verbosity: u8,
}

impl ValidationOptions {
    /// Rules a dynamic loader applies.
    pub fn loader(archs: GradedArchs, platform: Platform) -> Self {
        Self {
            archs,
            platform,
            file_types: FileTypes::LOADABLE,
            allow_static: false,
            is_os_binary: false,
            offline: false,
            verbosity: 1,
        }
    }

    /// Rules for inspection tools, which also accept dylinkers, kexts,
    /// kernel collections and static executables.
    pub fn offline(archs: GradedArchs, platform: Platform) -> Self {
        Self {
            archs,
            platform,
            file_types: FileTypes::all(),
            allow_static: true,
            is_os_binary: false,
            offline: true,
            verbosity: 1,
        }
    }

    pub fn with_file_types(mut self, file_types: FileTypes) -> Self {
        self.file_types = file_types;
        self
    }

    pub fn with_os_binary(mut self, is_os_binary: bool) -> Self {
        self.is_os_binary = is_os_binary;
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self::loader(GradedArchs::default(), Platform::MacOS)
    }
}

// =============================================================================
// Validated Image
// =============================================================================

/// An image that passed the first validation phase.
#[derive(Debug, Clone)]
pub struct ValidatedImage<'a> {
    image: MachOImage<'a>,
    path: String,
    options: ValidationOptions,
    linkedit_valid: bool,
}

impl<'a> ValidatedImage<'a> {
    pub fn image(&self) -> &MachOImage<'a> {
        &self.image
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &ValidationOptions {
        &self.options
    }

    /// Returns true once [`validate_linkedit`](Self::validate_linkedit)
    /// has succeeded.
    pub fn linkedit_valid(&self) -> bool {
        self.linkedit_valid
    }

    /// Second phase: LINKEDIT layout, then the fixup streams the image uses.
    ///
    /// Returns the warnings collected along the way.
    pub fn validate_linkedit(&mut self) -> Result<Vec<String>> {
        let checker = Checker::new(&self.image, &self.path, &self.options);
        checker.valid_linkedit_layout()?;

        let mut diag = Diagnostics::new().with_verbosity(self.options.verbosity);
        if self.image.has_load_command(LC_DYLD_CHAINED_FIXUPS) {
            debug!("{}: validating chained fixups", self.path);
            self.image.validate_chained_fixups(&mut diag);
        } else if self.image.is_arm64e() {
            debug!("{}: validating threaded binds", self.path);
            self.image.validate_threaded_binds(&mut diag);
        } else {
            debug!("{}: validating rebase and bind info", self.path);
            self.image.for_each_rebase(&mut diag, |_| ControlFlow::Continue(()));
            if diag.no_error() {
                self.image
                    .for_each_bind(&mut diag, |_| ControlFlow::Continue(()), |_| {});
            }
        }
        let path = self.path.clone();
        let warnings = diag.into_result().map_err(|e| e.in_file(&path))?;
        self.linkedit_valid = true;
        Ok(warnings)
    }
}

/// First validation phase: header, load commands, platform, embedded paths,
/// segments and the entry point.
pub fn validate<'a>(data: &'a [u8], path: &str, options: &ValidationOptions) -> Result<ValidatedImage<'a>> {
    let image = MachOImage::parse(data).map_err(|err| match err {
        Error::MalformedMagic(_) | Error::BufferTooSmall { .. } => Error::MalformedMagic(format!(
            "could not use '{}' because it is not a mach-o file: 0x{:08X} 0x{:08X}",
            path,
            get_u32_le(data, 0).unwrap_or(0),
            get_u32_le(data, 4).unwrap_or(0)
        )),
        other => other,
    })?;

    let checker = Checker::new(&image, path, options);
    checker.check_arch_and_filetype()?;
    checker.valid_load_commands()?;
    checker.check_static()?;
    checker.check_platform()?;
    checker.valid_embedded_paths()?;
    checker.valid_segments()?;
    if image.is_main_executable() {
        checker.valid_main()?;
    }
    debug!("{}: passed structural validation", path);

    Ok(ValidatedImage {
        image,
        path: path.to_string(),
        options: options.clone(),
        linkedit_valid: false,
    })
}

/// Both phases in one call.
pub fn validate_all<'a>(data: &'a [u8], path: &str, options: &ValidationOptions) -> Result<ValidatedImage<'a>> {
    let mut validated = validate(data, path, options)?;
    validated.validate_linkedit()?;
    Ok(validated)
}

// =============================================================================
// Checks
// =============================================================================

/// One validation run over one image.
pub(crate) struct Checker<'i, 'a> {
    pub image: &'i MachOImage<'a>,
    pub path: &'i str,
    pub options: &'i ValidationOptions,
}

impl<'i, 'a> Checker<'i, 'a> {
    pub fn new(image: &'i MachOImage<'a>, path: &'i str, options: &'i ValidationOptions) -> Self {
        Self { image, path, options }
    }

    /// Formats "in '<path>' <msg>".
    pub fn msg(&self, msg: impl std::fmt::Display) -> String {
        format!("in '{}' {}", self.path, msg)
    }

    #[inline]
    pub fn enforce(&self, rule: FormatRule) -> bool {
        self.image.enforce_format(rule)
    }

    fn check_arch_and_filetype(&self) -> Result<()> {
        let image = self.image;
        if !self
            .options
            .archs
            .accepts(image.cputype(), image.cpusubtype(), self.options.is_os_binary)
        {
            return Err(Error::MalformedArch(format!(
                "could not use '{}' because it is not a compatible arch",
                self.path
            )));
        }
        let accepted = FileTypes::from_filetype(image.filetype())
            .is_some_and(|t| self.options.file_types.contains(t));
        if !accepted {
            return Err(Error::MalformedFiletype(format!(
                "could not use '{}' because it is not a dylib, bundle, or executable, filetype=0x{:08X}",
                self.path,
                image.filetype()
            )));
        }
        Ok(())
    }

    fn valid_load_commands(&self) -> Result<()> {
        let image = self.image;
        let cmds_end = image.header().sizeofcmds as u64 + image.header_size() as u64;
        if cmds_end > image.len() as u64 {
            return Err(Error::MalformedLoadCommands(
                self.msg("load commands exceed length of file"),
            ));
        }

        for cmd in image.load_commands() {
            if let Err(err) = cmd {
                return Err(err.in_file(self.path));
            }
        }

        let Some(text) = image.segments().into_iter().find(|s| s.name == "__TEXT") else {
            return Err(Error::MalformedLoadCommands(self.msg("__TEXT segment not found")));
        };
        if cmds_end > text.file_size {
            return Err(Error::MalformedLoadCommands(
                self.msg("load commands exceed length of __TEXT segment"),
            ));
        }
        if text.file_offset != 0 {
            return Err(Error::MalformedLoadCommands(
                self.msg("__TEXT segment not start of mach-o"),
            ));
        }
        Ok(())
    }

    fn check_static(&self) -> Result<()> {
        if self.image.is_static_executable() && !self.options.allow_static {
            return Err(Error::MalformedFiletype(format!(
                "could not use '{}' because it is a static executable",
                self.path
            )));
        }
        Ok(())
    }

    fn check_platform(&self) -> Result<()> {
        let image = self.image;
        let requested = self.options.platform;
        if self.options.offline {
            if image.is_fileset() {
                // a statically linked kernel collection declares platform 0
                let platforms = image.supported_platforms();
                if platforms.is_empty() {
                    return Err(Error::MalformedPlatform(format!(
                        "could not use '{}' because we expected it to have a platform",
                        self.path
                    )));
                }
                if platforms.iter().any(|p| p.platform != Platform::Unknown) {
                    return Err(Error::MalformedPlatform(format!(
                        "could not use '{}' because is has the wrong platform",
                        self.path
                    )));
                }
                return Ok(());
            }
            if requested == Platform::Unknown {
                // the static kernel has a platform but kexts do not
                if !image.is_static_executable() && !image.supported_platforms().is_empty() {
                    return Err(Error::MalformedPlatform(format!(
                        "could not use '{}' because we expected it to have no platform",
                        self.path
                    )));
                }
                return Ok(());
            }
        }
        if !image.loadable_into_process(requested, self.path) {
            return Err(Error::MalformedPlatform(format!(
                "could not use '{}' because it was not built for platform {}",
                self.path,
                requested.name()
            )));
        }
        Ok(())
    }

    fn valid_embedded_paths(&self) -> Result<()> {
        let image = self.image;
        let mut found_install_name = false;
        let mut dependents = 0u32;
        for cmd in image.load_commands() {
            let cmd = cmd.map_err(|e| e.in_file(self.path))?;
            let ordinal = cmd.index + 1;
            let (offset, what) = match cmd.cmd {
                LC_ID_DYLIB | LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                    if cmd.cmd == LC_ID_DYLIB {
                        found_install_name = true;
                    } else {
                        dependents += 1;
                    }
                    let offset = cmd.read::<DylibCommand>().map(|d| d.name_offset);
                    (offset, "name")
                }
                LC_RPATH => (cmd.read::<RpathCommand>().map(|r| r.path_offset), "path"),
                _ => continue,
            };
            // a command too short for its fixed part has its offset outside too
            let offset = offset.unwrap_or(u32::MAX);
            if offset > cmd.cmdsize {
                return Err(Error::MalformedLoadCommands(self.msg(format_args!(
                    "load command #{} {} offset ({}) outside its size ({})",
                    ordinal, what, offset, cmd.cmdsize
                ))));
            }
            if cmd.cstr_at(offset).is_none() {
                return Err(Error::MalformedLoadCommands(self.msg(format_args!(
                    "load command #{} string extends beyond end of load command",
                    ordinal
                ))));
            }
        }

        if image.is_dylib() {
            if !found_install_name {
                return Err(Error::MalformedLoadCommands(
                    self.msg("MH_DYLIB is missing LC_ID_DYLIB"),
                ));
            }
        } else if found_install_name {
            return Err(Error::MalformedLoadCommands(
                self.msg("LC_ID_DYLIB found in non-MH_DYLIB"),
            ));
        }

        if dependents == 0 && image.is_dynamic_executable() {
            return Err(Error::MalformedLoadCommands(self.msg(
                "missing LC_LOAD_DYLIB (must link with at least libSystem.dylib)",
            )));
        }
        Ok(())
    }

    fn valid_segments(&self) -> Result<()> {
        let image = self.image;
        let file_len = image.len() as u64;

        // segment load command sizes
        for cmd in image.load_commands() {
            let cmd = cmd.map_err(|e| e.in_file(self.path))?;
            if cmd.cmd != LC_SEGMENT && cmd.cmd != LC_SEGMENT_64 {
                continue;
            }
            let Some(seg) = crate::macho::decode_segment(&cmd) else {
                return Err(Error::MalformedSegment(self.msg(format_args!(
                    "load command size too small for {}",
                    cmd.name()
                ))));
            };
            let sections_space = cmd.cmdsize as usize - seg.command_size();
            if sections_space % seg.section_size() != 0 {
                return Err(Error::MalformedSegment(self.msg(format_args!(
                    "segment load command size 0x{:X} will not fit whole number of sections",
                    cmd.cmdsize
                ))));
            }
            if sections_space as u64 != seg.nsects as u64 * seg.section_size() as u64 {
                return Err(Error::MalformedSegment(self.msg(format_args!(
                    "load command size 0x{:X} does not match nsects {}",
                    cmd.cmdsize, seg.nsects
                ))));
            }
            if seg.is_64 && greater_than_add_or_overflow(seg.fileoff, seg.filesize, file_len) {
                return Err(Error::MalformedSegment(
                    self.msg("segment load command content extends beyond end of file"),
                ));
            }
            // a non-allocated SG_NORELOC segment may carry content with vmsize 0
            if seg.filesize > seg.vmsize && (seg.vmsize != 0 || seg.flags & SG_NORELOC == 0) {
                return Err(Error::MalformedSegment(self.msg("segment filesize exceeds vmsize")));
            }
        }

        let segments = image.segments();

        // permissions and ranges
        let mut has_text = false;
        let mut has_linkedit = false;
        for seg in &segments {
            if seg.name == "__TEXT" {
                if seg.init_prot != (VM_PROT_READ | VM_PROT_EXECUTE) && self.enforce(FormatRule::TextPermissions) {
                    return Err(Error::MalformedSegment(
                        self.msg("__TEXT segment permissions is not 'r-x'"),
                    ));
                }
                has_text = true;
            } else if seg.name == "__LINKEDIT" {
                if seg.init_prot != VM_PROT_READ && self.enforce(FormatRule::LinkeditPermissions) {
                    return Err(Error::MalformedSegment(
                        self.msg("__LINKEDIT segment permissions is not 'r--'"),
                    ));
                }
                has_linkedit = true;
            } else if seg.init_prot & VM_PROT_INVALID_BITS != 0 {
                return Err(Error::MalformedSegment(self.msg(format_args!(
                    "{} segment permissions has invalid bits set",
                    seg.name
                ))));
            }
            if greater_than_add_or_overflow(seg.file_offset, seg.file_size, file_len) {
                return Err(Error::MalformedSegment(self.msg(format_args!(
                    "{} segment content extends beyond end of file",
                    seg.name
                ))));
            }
            let wraps = if image.is_64() {
                seg.vm_addr.checked_add(seg.vm_size).is_none()
            } else {
                (seg.vm_addr as u32).checked_add(seg.vm_size as u32).is_none()
            };
            if wraps {
                return Err(Error::MalformedSegment(self.msg(format_args!(
                    "{} segment vm range wraps",
                    seg.name
                ))));
            }
        }
        if !has_text {
            return Err(Error::MalformedSegment(self.msg("missing __TEXT segment")));
        }
        if !has_linkedit {
            return Err(Error::MalformedSegment(self.msg("missing __LINKEDIT segment")));
        }

        // overlap and order, all pairs
        for a in &segments {
            let a_vm_end = a.vm_addr + a.vm_size;
            let a_file_end = a.file_offset + a.file_size;
            for b in &segments {
                if a.index == b.index {
                    continue;
                }
                let b_vm_end = b.vm_addr + b.vm_size;
                let b_file_end = b.file_offset + b.file_size;
                if ranges_overlap(a.vm_addr, a_vm_end, b.vm_addr, b_vm_end) {
                    return Err(Error::MalformedSegment(self.msg(format_args!(
                        "segment {} vm range overlaps segment {}",
                        a.name, b.name
                    ))));
                }
                if ranges_overlap(a.file_offset, a_file_end, b.file_offset, b_file_end) {
                    return Err(Error::MalformedSegment(self.msg(format_args!(
                        "segment {} file content overlaps segment {}",
                        a.name, b.name
                    ))));
                }
                let out_of_order = a.vm_addr > b.vm_addr
                    || (a.file_offset > b.file_offset && a.file_offset != 0 && b.file_offset != 0);
                // cache builders move __DATA_* segments and the kernel maps below __TEXT
                if a.index < b.index
                    && out_of_order
                    && !image.in_dyld_cache()
                    && !image.is_static_executable()
                    && self.enforce(FormatRule::SegmentOrder)
                {
                    return Err(Error::MalformedSegment(self.msg(format_args!(
                        "segment load commands out of order with respect to layout for {} and {}",
                        a.name, b.name
                    ))));
                }
            }
        }

        // sections inside their segment
        for cmd in image.load_commands().map_while(|c| c.ok()) {
            let Some(seg) = crate::macho::decode_segment(&cmd) else {
                continue;
            };
            let seg_end = seg.vmaddr.wrapping_add(seg.vmsize);
            for sect in crate::macho::decode_sections(&cmd, &seg) {
                let name = crate::util::fixed_name(&sect.sectname);
                if (sect.size as i64) < 0 {
                    return Err(Error::MalformedSection(self.msg(format_args!(
                        "section '{}' size too large 0x{:X}",
                        name, sect.size
                    ))));
                }
                if sect.addr < seg.vmaddr {
                    return Err(Error::MalformedSection(self.msg(format_args!(
                        "section '{}' start address 0x{:X} is before containing segment's address 0x{:X}",
                        name, sect.addr, seg.vmaddr
                    ))));
                }
                let sect_end = sect.addr.wrapping_add(sect.size);
                if sect_end > seg_end {
                    // 32-bit images have always been held to this
                    let ignore = seg.is_64 && !self.enforce(FormatRule::SectionsAddrRangeWithinSegment);
                    if !ignore {
                        return Err(Error::MalformedSection(self.msg(format_args!(
                            "section '{}' end address 0x{:X} is beyond containing segment's end address 0x{:X}",
                            name, sect_end, seg_end
                        ))));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Half-open interval overlap; empty ranges overlap nothing.
#[inline]
fn ranges_overlap(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    a_start < a_end && b_start < b_end && a_start < b_end && b_start < a_end
}
