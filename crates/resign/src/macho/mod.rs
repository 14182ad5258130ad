//! Mach-O images: layout parsing, load-command edits and embedded
//! signatures for thin and universal files.

pub mod fat;
pub mod image;
pub mod layout;
pub mod signature;

pub use image::{MachOImage, SignOptions};
pub use signature::SignatureSummary;
