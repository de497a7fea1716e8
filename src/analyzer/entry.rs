//! Entry point validation for main executables.

use tracing::debug;

use super::validate::Checker;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{get_u32_le, get_u64_le};

impl<'a> MachOImage<'a> {
    /// Extracts the initial pc from an LC_UNIXTHREAD / LC_THREAD register
    /// state. Returns 0 for unknown architectures or a state that does not
    /// reach the pc register.
    pub fn entry_addr_from_thread_cmd(&self, cmd: &LoadCommandRef<'a>) -> u64 {
        // (register index, register width)
        let (index, width) = match self.cputype() {
            CPU_TYPE_I386 => (10, 4),
            CPU_TYPE_X86_64 => (16, 8),
            CPU_TYPE_ARM => (15, 4),
            CPU_TYPE_ARM64 => (32, 8),
            _ => return 0,
        };
        let at = ThreadCommand::SIZE + index * width;
        let value = if width == 8 {
            get_u64_le(cmd.bytes, at)
        } else {
            get_u32_le(cmd.bytes, at).map(u64::from)
        };
        value.unwrap_or(0)
    }
}

impl<'i, 'a> Checker<'i, 'a> {
    /// Exactly one of LC_MAIN or LC_UNIXTHREAD, pointing into executable
    /// code. DriverKit binaries have neither.
    pub(crate) fn valid_main(&self) -> Result<()> {
        let image = self.image;
        let static_offline = self.options.offline && image.is_static_executable();
        let text_name = if !static_offline {
            "__TEXT"
        } else if image.cputype() == CPU_TYPE_X86_64 {
            "__HIB"
        } else {
            "__TEXT_EXEC"
        };

        let segments = image.segments();
        let (text_start, text_size) = segments
            .iter()
            .find(|s| s.name == text_name)
            .map(|s| (s.vm_addr, s.vm_size))
            .unwrap_or((0, 0));
        let containing = |addr: u64| segments.iter().find(|s| s.contains_vm_addr(addr));

        let mut main_count = 0u32;
        let mut thread_count = 0u32;
        for cmd in image.load_commands() {
            let cmd = cmd.map_err(|e| e.in_file(self.path))?;
            match cmd.cmd {
                LC_MAIN => {
                    main_count += 1;
                    let Some(main) = cmd.read::<EntryPointCommand>() else {
                        return Err(self.entry_error("LC_MAIN load command size wrong"));
                    };
                    if main.entryoff >= text_size {
                        let start = image.preferred_load_address().wrapping_add(main.entryoff);
                        match containing(start) {
                            Some(seg) if seg.executable() => break,
                            Some(_) => return Err(self.entry_error("LC_MAIN points to non-executable segment")),
                            None => return Err(self.entry_error("LC_MAIN entryoff is out of range")),
                        }
                    }
                }
                LC_UNIXTHREAD => {
                    thread_count += 1;
                    let start = image.entry_addr_from_thread_cmd(&cmd);
                    if start == 0 {
                        return Err(self.entry_error(format!(
                            "LC_UNIXTHREAD not valid for arch {}",
                            image.arch_name()
                        )));
                    }
                    if static_offline {
                        match containing(start) {
                            Some(seg) if seg.executable() => break,
                            Some(_) => {
                                return Err(self.entry_error("LC_UNIXTHREAD points to non-executable segment"))
                            }
                            None => return Err(self.entry_error("LC_UNIXTHREAD entry is out of range")),
                        }
                    }
                    if start < text_start || start - text_start >= text_size {
                        return Err(self.entry_error(format!(
                            "LC_UNIXTHREAD entry not in {} segment",
                            text_name
                        )));
                    }
                }
                _ => {}
            }
        }

        let total = main_count + thread_count;
        if image.built_for_platform(Platform::DriverKit, false) {
            if total == 0 {
                return Ok(());
            }
            return Err(self.entry_error("no LC_MAIN allowed for driverkit"));
        }
        match total {
            1 => {
                debug!("{}: entry point ok", self.path);
                Ok(())
            }
            0 => Err(self.entry_error("missing LC_MAIN or LC_UNIXTHREAD")),
            _ => Err(self.entry_error("only one LC_MAIN or LC_UNIXTHREAD is allowed")),
        }
    }

    fn entry_error(&self, msg: impl std::fmt::Display) -> Error {
        Error::MalformedEntryPoint(self.msg(msg))
    }
}
