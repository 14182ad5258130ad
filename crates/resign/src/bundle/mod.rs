//! Application bundles.
//!
//! A bundle is sealed bottom-up: nested `.framework`/`.appex`/`.app`
//! bundles first, then loose Mach-O files, then the manifest in
//! `_CodeSignature/CodeResources`, then the main executable, whose
//! signature covers `Info.plist` and the manifest.
//!
//! # CodeResources Plist Structure
//!
//! | Key | Description |
//! |-----|-------------|
//! | `files` | Legacy SHA-1 hashes |
//! | `files2` | SHA-1 + SHA-256 hashes, symlink targets |
//! | `rules` | Legacy inclusion/exclusion patterns |
//! | `rules2` | Inclusion/exclusion patterns |
//!
//! # Examples
//!
//! ```no_run
//! use resign::bundle::CodeResourcesBuilder;
//!
//! let mut builder = CodeResourcesBuilder::new("Payload/MyApp.app");
//! builder.scan()?;
//! let plist_bytes = builder.build()?;
//! # Ok::<(), resign::Error>(())
//! ```

pub mod code_resources;
pub mod folder;

pub use code_resources::CodeResourcesBuilder;
pub use folder::FolderSigner;
