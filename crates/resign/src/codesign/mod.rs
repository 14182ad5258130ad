//! Embedded code signature structures.

pub mod blob;
pub mod code_directory;
pub mod constants;
pub mod der;

pub use blob::{SuperBlob, SuperBlobBuilder};
pub use code_directory::{CodeDirectory, CodeDirectoryBuilder, HashKind};
