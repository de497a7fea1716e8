//! Platforms and architecture grading.

use std::fmt;

use super::constants::*;

// =============================================================================
// Platform
// =============================================================================

/// OS platform a binary declares it was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Platform {
    /// No platform (pre-platform-metadata binaries, kernel collections)
    #[default]
    Unknown,
    /// macOS
    MacOS,
    /// iOS
    IOS,
    /// tvOS
    TvOS,
    /// watchOS
    WatchOS,
    /// bridgeOS
    BridgeOS,
    /// Mac Catalyst (iOS apps on macOS)
    MacCatalyst,
    /// iOS simulator
    IOSSimulator,
    /// tvOS simulator
    TvOSSimulator,
    /// watchOS simulator
    WatchOSSimulator,
    /// DriverKit
    DriverKit,
    /// A platform value this crate does not know about
    Other(u32),
}

impl Platform {
    /// Converts a raw `LC_BUILD_VERSION` platform value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Platform::Unknown,
            1 => Platform::MacOS,
            2 => Platform::IOS,
            3 => Platform::TvOS,
            4 => Platform::WatchOS,
            5 => Platform::BridgeOS,
            6 => Platform::MacCatalyst,
            7 => Platform::IOSSimulator,
            8 => Platform::TvOSSimulator,
            9 => Platform::WatchOSSimulator,
            10 => Platform::DriverKit,
            other => Platform::Other(other),
        }
    }

    /// Returns the raw on-disk value.
    pub fn raw(self) -> u32 {
        match self {
            Platform::Unknown => 0,
            Platform::MacOS => 1,
            Platform::IOS => 2,
            Platform::TvOS => 3,
            Platform::WatchOS => 4,
            Platform::BridgeOS => 5,
            Platform::MacCatalyst => 6,
            Platform::IOSSimulator => 7,
            Platform::TvOSSimulator => 8,
            Platform::WatchOSSimulator => 9,
            Platform::DriverKit => 10,
            Platform::Other(raw) => raw,
        }
    }

    /// Parses a platform name as printed by [`Platform::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        let platform = match name.to_ascii_lowercase().as_str() {
            "macos" | "osx" => Platform::MacOS,
            "ios" => Platform::IOS,
            "tvos" => Platform::TvOS,
            "watchos" => Platform::WatchOS,
            "bridgeos" => Platform::BridgeOS,
            "maccatalyst" | "iosmac" => Platform::MacCatalyst,
            "ios-sim" | "iossimulator" => Platform::IOSSimulator,
            "tvos-sim" | "tvossimulator" => Platform::TvOSSimulator,
            "watchos-sim" | "watchossimulator" => Platform::WatchOSSimulator,
            "driverkit" => Platform::DriverKit,
            "unknown" | "none" => Platform::Unknown,
            _ => return None,
        };
        Some(platform)
    }

    /// Returns the display name of the platform.
    pub fn name(self) -> &'static str {
        match self {
            Platform::MacOS => "macOS",
            Platform::IOS => "iOS",
            Platform::TvOS => "tvOS",
            Platform::WatchOS => "watchOS",
            Platform::BridgeOS => "bridgeOS",
            Platform::MacCatalyst => "MacCatalyst",
            Platform::IOSSimulator => "iOS-sim",
            Platform::TvOSSimulator => "tvOS-sim",
            Platform::WatchOSSimulator => "watchOS-sim",
            Platform::DriverKit => "driverKit",
            Platform::Unknown | Platform::Other(_) => "unknown platform",
        }
    }

    /// Returns true for the three simulator platforms.
    #[inline]
    pub fn is_simulator(self) -> bool {
        matches!(
            self,
            Platform::IOSSimulator | Platform::TvOSSimulator | Platform::WatchOSSimulator
        )
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One declared platform with its minimum OS and SDK versions (xxxx.yy.zz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformVersion {
    /// Declared platform
    pub platform: Platform,
    /// Minimum OS version
    pub min_os: u32,
    /// SDK version
    pub sdk: u32,
}

/// Formats a packed xxxx.yy.zz version as "X.Y.Z".
pub fn packed_version_string(packed: u32) -> String {
    format!("{}.{}.{}", packed >> 16, (packed >> 8) & 0xFF, packed & 0xFF)
}

/// Dylibs from a macOS host that may be loaded into a simulator process.
pub const MACOS_HOST_DYLIBS_FOR_SIMULATOR: &[&str] = &[
    "/usr/lib/system/libsystem_kernel.dylib",
    "/usr/lib/system/libsystem_platform.dylib",
    "/usr/lib/system/libsystem_pthread.dylib",
    "/usr/lib/system/libsystem_platform_debug.dylib",
    "/usr/lib/system/libsystem_pthread_debug.dylib",
    "/usr/lib/system/host/liblaunch_sim.dylib",
];

// =============================================================================
// Architecture Names
// =============================================================================

const ARCH_INFOS: &[(&str, u32, u32)] = &[
    ("x86_64", CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL),
    ("x86_64h", CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H),
    ("i386", CPU_TYPE_I386, CPU_SUBTYPE_I386_ALL),
    ("arm64", CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL),
    ("arm64e", CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E),
    ("arm64_32", CPU_TYPE_ARM64_32, CPU_SUBTYPE_ARM64_32_V8),
    ("armv7k", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K),
    ("armv7s", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7S),
    ("armv7", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7),
];

/// Returns the architecture name for a cpu type/subtype pair.
pub fn arch_name(cputype: u32, cpusubtype: u32) -> &'static str {
    let masked = cpusubtype & !CPU_SUBTYPE_MASK;
    ARCH_INFOS
        .iter()
        .find(|(_, ty, sub)| *ty == cputype && *sub == masked)
        .map(|(name, _, _)| *name)
        .unwrap_or("unknown")
}

/// Returns the cpu type/subtype pair for an architecture name.
pub fn cpu_type_from_arch_name(name: &str) -> Option<(u32, u32)> {
    ARCH_INFOS
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, ty, sub)| (*ty, *sub))
}

// =============================================================================
// Graded Architectures
// =============================================================================

/// One rung of an architecture preference ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuGrade {
    /// CPU type
    pub cputype: u32,
    /// CPU subtype with capability bits masked off
    pub cpusubtype: u32,
    /// Only OS (platform) binaries may match this rung
    pub os_binary: bool,
    /// Higher is better; 0 means not loadable
    pub grade: u32,
}

const fn rung(cputype: u32, cpusubtype: u32, os_binary: bool, grade: u32) -> CpuGrade {
    CpuGrade {
        cputype,
        cpusubtype,
        os_binary,
        grade,
    }
}

/// An ordered set of acceptable architectures with preference grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradedArchs {
    grades: &'static [CpuGrade],
}

impl GradedArchs {
    #[allow(missing_docs)]
    pub const I386: Self = Self {
        grades: &[rung(CPU_TYPE_I386, CPU_SUBTYPE_I386_ALL, false, 1)],
    };
    #[allow(missing_docs)]
    pub const X86_64: Self = Self {
        grades: &[rung(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, false, 1)],
    };
    /// Haswell preferred, plain x86_64 accepted.
    pub const X86_64H: Self = Self {
        grades: &[
            rung(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H, false, 2),
            rung(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, false, 1),
        ],
    };
    #[allow(missing_docs)]
    pub const ARM64: Self = Self {
        grades: &[rung(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, false, 1)],
    };
    #[allow(missing_docs)]
    pub const ARM64E: Self = Self {
        grades: &[rung(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, false, 1)],
    };
    /// arm64e only for OS binaries.
    pub const ARM64E_PB: Self = Self {
        grades: &[rung(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, true, 1)],
    };
    /// arm64e preferred, arm64 accepted (pointer auth keys off).
    pub const ARM64E_KEYSOFF: Self = Self {
        grades: &[
            rung(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, false, 2),
            rung(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, false, 1),
        ],
    };
    /// arm64e preferred for OS binaries, arm64 accepted.
    pub const ARM64E_KEYSOFF_PB: Self = Self {
        grades: &[
            rung(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, true, 2),
            rung(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, false, 1),
        ],
    };
    #[allow(missing_docs)]
    pub const ARMV7: Self = Self {
        grades: &[rung(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, false, 1)],
    };
    /// armv7s preferred, armv7 accepted.
    pub const ARMV7S: Self = Self {
        grades: &[
            rung(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7S, false, 2),
            rung(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7, false, 1),
        ],
    };
    #[allow(missing_docs)]
    pub const ARMV7K: Self = Self {
        grades: &[rung(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K, false, 1)],
    };
    #[allow(missing_docs)]
    pub const ARM64_32: Self = Self {
        grades: &[rung(CPU_TYPE_ARM64_32, CPU_SUBTYPE_ARM64_32_V8, false, 1)],
    };

    /// Returns the grade of a slice, 0 if it is not acceptable.
    pub fn grade(&self, cputype: u32, cpusubtype: u32, is_os_binary: bool) -> u32 {
        let masked = cpusubtype & !CPU_SUBTYPE_MASK;
        self.grades
            .iter()
            .find(|g| g.cputype == cputype && g.cpusubtype == masked && (!g.os_binary || is_os_binary))
            .map(|g| g.grade)
            .unwrap_or(0)
    }

    /// Returns true if any rung accepts the given cpu type/subtype.
    #[inline]
    pub fn accepts(&self, cputype: u32, cpusubtype: u32, is_os_binary: bool) -> bool {
        self.grade(cputype, cpusubtype, is_os_binary) != 0
    }

    /// Name of the best rung.
    pub fn name(&self) -> &'static str {
        self.grades
            .first()
            .map(|g| arch_name(g.cputype, g.cpusubtype))
            .unwrap_or("unknown")
    }

    /// Looks up a preset by architecture name.
    pub fn from_name(name: &str, keys_off: bool) -> Option<Self> {
        let archs = match name {
            "x86_64h" => Self::X86_64H,
            "x86_64" => Self::X86_64,
            "arm64e" if keys_off => Self::ARM64E_KEYSOFF,
            "arm64e" => Self::ARM64E,
            "arm64" => Self::ARM64,
            "armv7k" => Self::ARMV7K,
            "armv7s" => Self::ARMV7S,
            "armv7" => Self::ARMV7,
            "arm64_32" => Self::ARM64_32,
            "i386" => Self::I386,
            _ => return None,
        };
        Some(archs)
    }
}

impl Default for GradedArchs {
    fn default() -> Self {
        Self::ARM64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_round_trip_names() {
        for raw in 0..=10 {
            let platform = Platform::from_raw(raw);
            assert_eq!(platform.raw(), raw);
        }
        assert_eq!(Platform::from_raw(77), Platform::Other(77));
        assert_eq!(Platform::MacCatalyst.name(), "MacCatalyst");
        assert_eq!(Platform::from_name("iOS-sim"), Some(Platform::IOSSimulator));
        assert!(Platform::WatchOSSimulator.is_simulator());
        assert!(!Platform::WatchOS.is_simulator());
    }

    #[test]
    fn test_packed_version() {
        assert_eq!(packed_version_string(0x000A0F00), "10.15.0");
        assert_eq!(packed_version_string(0x000E0102), "14.1.2");
    }

    #[test]
    fn test_grading_ladder() {
        let archs = GradedArchs::X86_64H;
        assert_eq!(archs.grade(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H, false), 2);
        assert_eq!(archs.grade(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, false), 1);
        assert_eq!(archs.grade(CPU_TYPE_ARM64, 0, false), 0);
        assert_eq!(archs.name(), "x86_64h");
    }

    #[test]
    fn test_grading_masks_capability_bits() {
        let archs = GradedArchs::ARM64E;
        assert!(archs.accepts(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E | CPU_SUBTYPE_PTRAUTH_ABI, false));
    }

    #[test]
    fn test_os_binary_only_rungs() {
        let archs = GradedArchs::ARM64E_KEYSOFF_PB;
        assert_eq!(archs.grade(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, false), 0);
        assert_eq!(archs.grade(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, true), 2);
        assert_eq!(archs.grade(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, false), 1);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(GradedArchs::from_name("arm64e", true), Some(GradedArchs::ARM64E_KEYSOFF));
        assert_eq!(GradedArchs::from_name("sparc", false), None);
        assert_eq!(arch_name(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K), "armv7k");
        assert_eq!(cpu_type_from_arch_name("i386"), Some((CPU_TYPE_I386, CPU_SUBTYPE_I386_ALL)));
    }
}
