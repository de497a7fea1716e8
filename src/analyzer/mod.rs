//! Structural validation of Mach-O images.
//!
//! Validation runs in two phases. [`validate`] checks the header, load
//! commands, platform, segments and entry point and hands back a
//! [`ValidatedImage`]. The caller may then remap the file (see
//! [`remap_if_zero_fill`]) before [`ValidatedImage::validate_linkedit`]
//! checks the LINKEDIT layout and every fixup stream.

mod enforce;
mod entry;
mod layout;
mod linkedit;
mod validate;

pub use enforce::*;
pub use layout::*;
pub use linkedit::*;
pub use validate::*;
