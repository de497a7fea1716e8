//! Dynamic linker metadata.
//!
//! Everything dyld reads out of LINKEDIT to fix up and link an image:
//!
//! - Rebase and bind opcode streams of LC_DYLD_INFO
//! - Classic relocations and indirect symbols of older images
//! - Chained fixups, including the threaded binds of early arm64e images
//! - The export trie
//!
//! The walkers report records through callbacks that return
//! [`ControlFlow`](std::ops::ControlFlow), and report malformed content
//! through [`Diagnostics`](crate::diag::Diagnostics).

mod bind;
mod chained;
mod fixup;
mod indirect;
mod rebase;
mod relocs;
mod threaded;
pub mod trie;

pub use chained::*;
pub use fixup::*;
pub use indirect::*;
pub use trie::*;
