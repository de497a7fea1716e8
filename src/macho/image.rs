//! Borrowed view over a Mach-O image and the load command walker.
//!
//! [`MachOImage`] never copies the backing buffer. Every accessor reads
//! through a bounds-checked offset, so walking an image that has not been
//! validated yet is safe; it just reports errors instead of data.

use std::ops::ControlFlow;

use zerocopy::FromBytes;

use super::constants::*;
use super::platform::{arch_name, Platform, PlatformVersion, MACOS_HOST_DYLIBS_FOR_SIMULATOR};
use super::structs::*;
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::util::{get_u32_le, read_cstr};

// =============================================================================
// Header
// =============================================================================

/// Mach-O header fields common to the 32- and 64-bit layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// MH_MAGIC or MH_MAGIC_64
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype, including capability bits
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of the load command area
    pub sizeofcmds: u32,
    /// Header flags
    pub flags: u32,
}

// =============================================================================
// Load Commands
// =============================================================================

/// One load command, bounded to its declared size.
#[derive(Debug, Clone, Copy)]
pub struct LoadCommandRef<'a> {
    /// Position in load command order
    pub index: u32,
    /// Command kind
    pub cmd: u32,
    /// Declared size in bytes
    pub cmdsize: u32,
    /// File offset of the command
    pub offset: usize,
    /// The `cmdsize` bytes of the command
    pub bytes: &'a [u8],
}

impl<'a> LoadCommandRef<'a> {
    /// Copies the command out as `T`, or `None` if `cmdsize` is too small.
    #[inline]
    pub fn read<T: FromBytes>(&self) -> Option<T> {
        read_struct(self.bytes, 0)
    }

    /// Returns the NUL-terminated string at `offset` within this command.
    #[inline]
    pub fn cstr_at(&self, offset: u32) -> Option<&'a [u8]> {
        read_cstr(self.bytes, offset as usize)
    }

    /// Returns the command name.
    pub fn name(&self) -> &'static str {
        load_command_name(self.cmd)
    }
}

/// Iterator over load commands. Yields at most one error, then stops.
#[derive(Debug, Clone)]
pub struct LoadCommands<'a> {
    data: &'a [u8],
    ncmds: u32,
    index: u32,
    offset: usize,
    end: usize,
    done: bool,
}

impl<'a> Iterator for LoadCommands<'a> {
    type Item = Result<LoadCommandRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.index >= self.ncmds {
            return None;
        }
        let index = self.index;
        let offset = self.offset;

        let header = if offset + LoadCommand::SIZE <= self.end {
            read_struct::<LoadCommand>(self.data, offset)
        } else {
            None
        };
        let Some(header) = header else {
            self.done = true;
            return Some(Err(Error::MalformedLoadCommands(format!(
                "malformed load command #{} of {} at 0x{:X}, header extends past end of load commands at 0x{:X}",
                index, self.ncmds, offset, self.end
            ))));
        };

        if header.cmdsize < LoadCommand::SIZE as u32 {
            self.done = true;
            return Some(Err(Error::MalformedLoadCommands(format!(
                "malformed load command #{} of {} at 0x{:X}, size (0x{:X}) too small",
                index, self.ncmds, offset, header.cmdsize
            ))));
        }

        let next = offset as u64 + header.cmdsize as u64;
        if next > self.end as u64 {
            self.done = true;
            return Some(Err(Error::MalformedLoadCommands(format!(
                "malformed load command #{} of {} at 0x{:X}, size (0x{:X}) is too large, load commands end at 0x{:X}",
                index, self.ncmds, offset, header.cmdsize, self.end
            ))));
        }

        let next = next as usize;
        self.index += 1;
        self.offset = next;
        Some(Ok(LoadCommandRef {
            index,
            cmd: header.cmd,
            cmdsize: header.cmdsize,
            offset,
            bytes: &self.data[offset..next],
        }))
    }
}

// =============================================================================
// Mach-O Image
// =============================================================================

/// A Mach-O image borrowed from a byte buffer.
#[derive(Debug, Clone, Copy)]
pub struct MachOImage<'a> {
    data: &'a [u8],
    header: Header,
}

impl<'a> MachOImage<'a> {
    /// Wraps `data`, checking only the magic and that the header fits.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let magic = get_u32_le(data, 0).ok_or(Error::buffer_too_small(4, data.len()))?;
        let header = match magic {
            MH_MAGIC_64 => {
                let h: MachHeader64 = read_struct(data, 0)
                    .ok_or(Error::buffer_too_small(MachHeader64::SIZE, data.len()))?;
                Header {
                    magic,
                    cputype: h.cputype,
                    cpusubtype: h.cpusubtype,
                    filetype: h.filetype,
                    ncmds: h.ncmds,
                    sizeofcmds: h.sizeofcmds,
                    flags: h.flags,
                }
            }
            MH_MAGIC => {
                let h: MachHeader = read_struct(data, 0)
                    .ok_or(Error::buffer_too_small(MachHeader::SIZE, data.len()))?;
                Header {
                    magic,
                    cputype: h.cputype,
                    cpusubtype: h.cpusubtype,
                    filetype: h.filetype,
                    ncmds: h.ncmds,
                    sizeofcmds: h.sizeofcmds,
                    flags: h.flags,
                }
            }
            MH_CIGAM | MH_CIGAM_64 => {
                return Err(Error::MalformedMagic(
                    "big endian mach-o files are not supported".into(),
                ));
            }
            _ => {
                let second = get_u32_le(data, 4).unwrap_or(0);
                return Err(Error::MalformedMagic(format!(
                    "file does not start with MH_MAGIC[_64]: 0x{:08X} 0x{:08X}",
                    magic, second
                )));
            }
        };
        Ok(Self { data, header })
    }

    /// Returns true if `data` starts with a little-endian Mach-O magic.
    pub fn has_macho_magic(data: &[u8]) -> bool {
        matches!(get_u32_le(data, 0), Some(MH_MAGIC) | Some(MH_MAGIC_64))
    }

    /// The backing bytes.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Length of the backing buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the backing buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The normalized header.
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn is_64(&self) -> bool {
        self.header.magic == MH_MAGIC_64
    }

    /// Size of the mach header (28 or 32).
    #[inline]
    pub fn header_size(&self) -> usize {
        if self.is_64() {
            MachHeader64::SIZE
        } else {
            MachHeader::SIZE
        }
    }

    /// Pointer width in bytes (4 or 8).
    #[inline]
    pub fn pointer_size(&self) -> u32 {
        if self.is_64() {
            8
        } else {
            4
        }
    }

    #[inline]
    pub fn cputype(&self) -> u32 {
        self.header.cputype
    }

    #[inline]
    pub fn cpusubtype(&self) -> u32 {
        self.header.cpusubtype
    }

    /// Subtype with the capability bits removed.
    #[inline]
    pub fn masked_cpusubtype(&self) -> u32 {
        self.header.cpusubtype & !CPU_SUBTYPE_MASK
    }

    #[inline]
    pub fn filetype(&self) -> u32 {
        self.header.filetype
    }

    /// Header flags as a typed set (unknown bits kept).
    #[inline]
    pub fn flags(&self) -> MachOFlags {
        MachOFlags::from_bits_retain(self.header.flags)
    }

    /// Architecture name, e.g. "arm64e".
    pub fn arch_name(&self) -> &'static str {
        arch_name(self.header.cputype, self.header.cpusubtype)
    }

    #[inline]
    pub fn is_arm64e(&self) -> bool {
        self.header.cputype == CPU_TYPE_ARM64 && self.masked_cpusubtype() == CPU_SUBTYPE_ARM64E
    }

    /// Returns true for architectures that use 16KB pages.
    pub fn uses_16k_pages(&self) -> bool {
        match self.header.cputype {
            CPU_TYPE_ARM64 | CPU_TYPE_ARM64_32 => true,
            CPU_TYPE_ARM => self.header.cpusubtype == CPU_SUBTYPE_ARM_V7K,
            _ => false,
        }
    }

    /// Returns true if the image was built into a dyld shared cache.
    #[inline]
    pub fn in_dyld_cache(&self) -> bool {
        self.flags().contains(MachOFlags::DYLIB_IN_CACHE)
    }

    #[inline]
    pub fn is_two_level_namespace(&self) -> bool {
        self.flags().contains(MachOFlags::TWOLEVEL)
    }

    #[inline]
    pub fn has_weak_defs(&self) -> bool {
        self.flags().contains(MachOFlags::WEAK_DEFINES)
    }

    #[inline]
    pub fn is_dylib(&self) -> bool {
        self.header.filetype == MH_DYLIB
    }

    #[inline]
    pub fn is_bundle(&self) -> bool {
        self.header.filetype == MH_BUNDLE
    }

    #[inline]
    pub fn is_main_executable(&self) -> bool {
        self.header.filetype == MH_EXECUTE
    }

    #[inline]
    pub fn is_dylinker(&self) -> bool {
        self.header.filetype == MH_DYLINKER
    }

    #[inline]
    pub fn is_kext_bundle(&self) -> bool {
        self.header.filetype == MH_KEXT_BUNDLE
    }

    #[inline]
    pub fn is_fileset(&self) -> bool {
        self.header.filetype == MH_FILESET
    }

    #[inline]
    pub fn is_preload(&self) -> bool {
        self.header.filetype == MH_PRELOAD
    }

    /// An executable that asks for a dynamic linker.
    pub fn is_dynamic_executable(&self) -> bool {
        self.is_main_executable() && self.has_load_command(LC_LOAD_DYLINKER)
    }

    /// An executable with no dynamic linker.
    pub fn is_static_executable(&self) -> bool {
        self.is_main_executable() && !self.has_load_command(LC_LOAD_DYLINKER)
    }

    // -------------------------------------------------------------------------
    // Load command walking
    // -------------------------------------------------------------------------

    /// Returns an iterator over the load commands.
    ///
    /// The area is bounded by both `sizeofcmds` and the buffer length, so a
    /// header that lies about its command size cannot push reads out of
    /// bounds.
    pub fn load_commands(&self) -> LoadCommands<'a> {
        let start = self.header_size();
        let declared_end = start as u64 + self.header.sizeofcmds as u64;
        let end = declared_end.min(self.data.len() as u64) as usize;
        LoadCommands {
            data: self.data,
            ncmds: self.header.ncmds,
            index: 0,
            offset: start,
            end,
            done: false,
        }
    }

    /// Calls `f` for every load command until it breaks or the walk fails.
    ///
    /// A malformed command is recorded in `diag` and ends the walk.
    pub fn for_each_load_command<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(&LoadCommandRef<'a>) -> ControlFlow<()>,
    {
        for cmd in self.load_commands() {
            match cmd {
                Ok(cmd) => {
                    if f(&cmd).is_break() {
                        return;
                    }
                }
                Err(err) => {
                    diag.error(err);
                    return;
                }
            }
        }
    }

    /// Returns the first command of kind `cmd`, ignoring walk errors.
    pub fn find_load_command(&self, cmd: u32) -> Option<LoadCommandRef<'a>> {
        self.load_commands()
            .map_while(|c| c.ok())
            .find(|c| c.cmd == cmd)
    }

    /// Returns true if a command of kind `cmd` is present.
    pub fn has_load_command(&self, cmd: u32) -> bool {
        self.find_load_command(cmd).is_some()
    }

    /// Returns true if the image uses chained fixups (arm64e dyld info images
    /// use the threaded variant).
    pub fn has_chained_fixups(&self) -> bool {
        if self.is_arm64e() {
            return self.has_load_command(LC_DYLD_INFO_ONLY)
                || self.has_load_command(LC_DYLD_CHAINED_FIXUPS);
        }
        self.has_load_command(LC_DYLD_CHAINED_FIXUPS)
    }

    /// Checks the header and walks the command area once.
    ///
    /// The result reflects this image only; an error already recorded in
    /// `diag` does not make it fail.
    pub fn is_macho(&self, diag: &mut Diagnostics) -> bool {
        let cmds_end = self.header.sizeofcmds as u64 + self.header_size() as u64;
        if cmds_end > self.data.len() as u64 {
            diag.error(Error::MalformedLoadCommands(
                "load commands exceed length of first segment".into(),
            ));
            return false;
        }
        let mut local = Diagnostics::new();
        self.for_each_load_command(&mut local, |_| ControlFlow::Continue(()));
        match local.take_error() {
            Some(err) => {
                diag.error(err);
                false
            }
            None => true,
        }
    }

    // -------------------------------------------------------------------------
    // Platforms
    // -------------------------------------------------------------------------

    /// Returns every platform declared by a build-version or version-min
    /// command.
    pub fn supported_platforms(&self) -> Vec<PlatformVersion> {
        let intel = matches!(self.header.cputype, CPU_TYPE_X86_64 | CPU_TYPE_I386);
        let mut out = Vec::new();
        for cmd in self.load_commands().map_while(|c| c.ok()) {
            let found = match cmd.cmd {
                LC_BUILD_VERSION => cmd.read::<BuildVersionCommand>().map(|b| {
                    (Platform::from_raw(b.platform), b.minos, b.sdk)
                }),
                LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_TVOS
                | LC_VERSION_MIN_WATCHOS => cmd.read::<VersionMinCommand>().map(|v| {
                    // old simulator binaries used the device version-min commands
                    let platform = match cmd.cmd {
                        LC_VERSION_MIN_MACOSX => Platform::MacOS,
                        LC_VERSION_MIN_IPHONEOS if intel => Platform::IOSSimulator,
                        LC_VERSION_MIN_IPHONEOS => Platform::IOS,
                        LC_VERSION_MIN_TVOS if self.header.cputype == CPU_TYPE_X86_64 => {
                            Platform::TvOSSimulator
                        }
                        LC_VERSION_MIN_TVOS => Platform::TvOS,
                        _ if intel => Platform::WatchOSSimulator,
                        _ => Platform::WatchOS,
                    };
                    (platform, v.version, v.sdk)
                }),
                _ => None,
            };
            if let Some((platform, min_os, sdk)) = found {
                out.push(PlatformVersion {
                    platform,
                    min_os,
                    sdk,
                });
            }
        }
        out
    }

    /// Returns true if the image declares `platform`. With `only_one`, any
    /// other declared platform disqualifies the image.
    pub fn built_for_platform(&self, platform: Platform, only_one: bool) -> bool {
        let mut found_requested = false;
        let mut found_other = false;
        for p in self.supported_platforms() {
            if p.platform == platform {
                found_requested = true;
            } else {
                found_other = true;
            }
        }
        if found_other && only_one {
            return false;
        }
        if found_requested {
            return true;
        }
        // no platform load command: old macOS binaries are recognized by arch
        if !found_other && platform == Platform::MacOS {
            return matches!(self.header.cputype, CPU_TYPE_X86_64 | CPU_TYPE_I386);
        }
        !found_other && platform == Platform::Unknown
    }

    /// Returns true if the image may be loaded into a process running on
    /// `process_platform`.
    pub fn loadable_into_process(&self, process_platform: Platform, path: &str) -> bool {
        if self.built_for_platform(process_platform, false) {
            return true;
        }

        if process_platform.is_simulator()
            && self.built_for_platform(Platform::MacOS, false)
            && MACOS_HOST_DYLIBS_FOR_SIMULATOR.contains(&path)
        {
            return true;
        }

        if self.is_main_executable()
            && process_platform == Platform::MacOS
            && self.built_for_platform(Platform::MacCatalyst, true)
        {
            return true;
        }

        process_platform == Platform::MacCatalyst && self.built_for_platform(Platform::MacOS, true)
    }

    /// Returns true if built for both macOS and Mac Catalyst.
    pub fn is_zippered(&self) -> bool {
        let platforms = self.supported_platforms();
        platforms.iter().any(|p| p.platform == Platform::MacOS)
            && platforms.iter().any(|p| p.platform == Platform::MacCatalyst)
    }
}
