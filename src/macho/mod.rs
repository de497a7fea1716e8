//! Mach-O file format handling.
//!
//! This module provides the on-disk structures of Mach-O files, a borrowed
//! image view with its load command walker, and the segment, section and
//! platform queries built on top of it.

mod constants;
mod image;
mod platform;
mod segments;
mod structs;

pub use constants::*;
pub use image::*;
pub use platform::*;
pub use segments::*;
pub use structs::*;
