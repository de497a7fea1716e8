//! Version-gated format rules.
//!
//! Newer linkers guarantee stricter layouts than older ones did. Each
//! [`FormatRule`] is enforced only for binaries whose declared SDK is at or
//! above the version where the rule became true, so binaries built before a
//! rule existed keep loading.

use std::fmt;

use tracing::debug;

use crate::macho::{MachOImage, Platform};

/// A structural rule that only newer binaries are held to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatRule {
    /// LINKEDIT blobs do not overlap
    LinkeditOrder,
    /// LINKEDIT blobs are aligned
    LinkeditAlignment,
    /// LC_DYLD_INFO_ONLY is not combined with local relocations
    DyldInfoAndLocalRelocs,
    /// Segment load commands are sorted by address
    SegmentOrder,
    /// __LINKEDIT is read-only
    LinkeditPermissions,
    /// __TEXT is r-x
    TextPermissions,
    /// Pointer fixups are not in executable segments
    ExecutableData,
    /// Pointer fixups are in writable segments
    WritableData,
    /// The code signature is 16-byte aligned
    CodeSigAlignment,
    /// Sections end inside their segment
    SectionsAddrRangeWithinSegment,
}

impl FormatRule {
    /// Every rule, in declaration order.
    pub const ALL: [FormatRule; 10] = [
        FormatRule::LinkeditOrder,
        FormatRule::LinkeditAlignment,
        FormatRule::DyldInfoAndLocalRelocs,
        FormatRule::SegmentOrder,
        FormatRule::LinkeditPermissions,
        FormatRule::TextPermissions,
        FormatRule::ExecutableData,
        FormatRule::WritableData,
        FormatRule::CodeSigAlignment,
        FormatRule::SectionsAddrRangeWithinSegment,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FormatRule::LinkeditOrder => "linkedit-order",
            FormatRule::LinkeditAlignment => "linkedit-alignment",
            FormatRule::DyldInfoAndLocalRelocs => "dyld-info-and-local-relocs",
            FormatRule::SegmentOrder => "segment-order",
            FormatRule::LinkeditPermissions => "linkedit-permissions",
            FormatRule::TextPermissions => "text-permissions",
            FormatRule::ExecutableData => "executable-data",
            FormatRule::WritableData => "writable-data",
            FormatRule::CodeSigAlignment => "code-sig-alignment",
            FormatRule::SectionsAddrRangeWithinSegment => "sections-in-range",
        }
    }
}

impl fmt::Display for FormatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When a rule applies to binaries declaring a given platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Every binary for the platform
    Always,
    /// Binaries whose SDK is at least this packed version (xxxx.yy.zz)
    FromSdk(u32),
}

impl Enforcement {
    #[inline]
    pub fn applies(self, sdk: u32) -> bool {
        match self {
            Enforcement::Always => true,
            Enforcement::FromSdk(min) => sdk >= min,
        }
    }
}

const MACOS_10_14: u32 = 0x000A_0E00;
const MACOS_10_15: u32 = 0x000A_0F00;
const MACOS_10_16: u32 = 0x000A_1000;
const IOS_13: u32 = 0x000D_0000;
const IOS_14: u32 = 0x000E_0000;

/// The rule table: which SDK makes `rule` binding for `platform`.
///
/// Platforms without an entry have enforced every rule since they shipped.
pub fn enforcement(platform: Platform, rule: FormatRule) -> Enforcement {
    use FormatRule::*;
    match (platform, rule) {
        (Platform::MacOS, LinkeditOrder | LinkeditAlignment | DyldInfoAndLocalRelocs) => {
            Enforcement::FromSdk(MACOS_10_14)
        }
        (
            Platform::MacOS,
            SegmentOrder | LinkeditPermissions | TextPermissions | ExecutableData | WritableData
            | CodeSigAlignment,
        ) => Enforcement::FromSdk(MACOS_10_15),
        (Platform::MacOS, SectionsAddrRangeWithinSegment) => Enforcement::FromSdk(MACOS_10_16),

        (Platform::IOS, LinkeditOrder | DyldInfoAndLocalRelocs | TextPermissions | ExecutableData | WritableData) => {
            Enforcement::Always
        }
        (Platform::IOS, LinkeditAlignment | SegmentOrder | LinkeditPermissions | CodeSigAlignment) => {
            Enforcement::FromSdk(IOS_13)
        }
        (Platform::IOS, SectionsAddrRangeWithinSegment) => Enforcement::FromSdk(IOS_14),

        _ => Enforcement::Always,
    }
}

/// Rules for kernel collections, which have their own layout.
fn kernel_collection_rule(rule: FormatRule) -> bool {
    // the auxiliary collection maps __DATA first and the kernel has __TEXT_EXEC
    !matches!(rule, FormatRule::SegmentOrder | FormatRule::TextPermissions)
}

/// Rules for static executables such as the kernel.
fn static_executable_rule(rule: FormatRule) -> bool {
    // the kernel maps __DATA_CONST read-only and puts vm addresses before __TEXT
    !matches!(rule, FormatRule::SegmentOrder | FormatRule::WritableData)
}

impl<'a> MachOImage<'a> {
    /// Returns true if this image is held to `rule`.
    ///
    /// An image with no platform load command predates platform metadata and
    /// is held to none of the rules. With several declared platforms, any one
    /// of them requiring the rule is enough.
    pub fn enforce_format(&self, rule: FormatRule) -> bool {
        if self.is_fileset() {
            return kernel_collection_rule(rule);
        }
        if self.is_static_executable() {
            return static_executable_rule(rule);
        }
        let enforced = self
            .supported_platforms()
            .iter()
            .any(|p| enforcement(p.platform, rule).applies(p.sdk));
        if !enforced {
            debug!("not enforcing {} for this binary's SDK", rule);
        }
        enforced
    }
}
