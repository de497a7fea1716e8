//! machoguard - Structural analysis and validation of Mach-O images.
//!
//! This library checks that a Mach-O file is safe to hand to a loader: the
//! header, load commands, segments and sections must be consistent, and every
//! LINKEDIT stream (rebase and bind opcodes, chained fixups, relocations,
//! the export trie) must stay within the image and follow its grammar.
//! Once an image has been validated its contents can be walked freely.
//!
//! # Features
//!
//! - Zero-copy parsing over a borrowed or memory-mapped buffer
//! - Fat file slice selection by architecture grade
//! - Rebase, bind, lazy and weak bind opcode interpreters
//! - Chained fixups, including legacy arm64e threaded binds
//! - Export trie walking with cycle detection
//! - Zero-fill remapping into the runtime layout
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use machoguard::{FileProvider, MmapFileProvider, ValidationOptions};
//!
//! fn main() -> machoguard::Result<()> {
//!     let options = ValidationOptions::default();
//!     let file = MmapFileProvider.load_slice(Path::new("/usr/lib/libz.dylib"), &options)?;
//!     let loaded = file.validate(&options)?;
//!
//!     let mut diag = machoguard::Diagnostics::new();
//!     for export in loaded.image().exports(&mut diag) {
//!         println!("{:#x} {}", export.image_offset, export.name);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod analyzer;
pub mod diag;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod metadata;
pub mod provider;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use analyzer::{validate, validate_all, FileTypes, ValidatedImage, ValidationOptions};
pub use diag::Diagnostics;
pub use error::{Error, ErrorKind, Result};
pub use macho::{GradedArchs, MachOImage, Platform};
pub use provider::{FileProvider, LoadedFile, LoadedImage, MemoryFileProvider, MmapFileProvider};
