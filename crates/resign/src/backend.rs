//! Collaborator contracts the orchestrator drives, and the native
//! implementation of them.
//!
//! The orchestrator never touches Mach-O bytes, bundle trees or key
//! material directly. It asks a [`Backend`] to load assets, open images and
//! sign folders, so tests can substitute a recording backend.

use crate::bundle::FolderSigner;
use crate::crypto::SigningAssets;
use crate::macho::image::open_target;
use crate::workspace::Staging;
use crate::Result;
use secrecy::SecretString;
use std::path::{Path, PathBuf};

/// Inputs to signing-asset construction.
#[derive(Debug, Clone, Default)]
pub struct AssetParams {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub provisioning_profile: Option<PathBuf>,
    pub password: Option<SecretString>,
    pub entitlements: Option<PathBuf>,
    pub adhoc: bool,
    pub sha256_only: bool,
    /// Signing a lone Mach-O rather than a bundle.
    pub single_file: bool,
}

/// One bundle-signing call.
#[derive(Debug, Clone, Copy)]
pub struct FolderJob<'a> {
    pub path: &'a Path,
    pub bundle_id: Option<&'a str>,
    pub bundle_version: Option<&'a str>,
    pub bundle_name: Option<&'a str>,
    pub dylibs: &'a [String],
    pub force: bool,
    pub weak_inject: bool,
    pub top_level: bool,
}

/// Digests and manifest of a successful signing call.
///
/// Image-level for a Mach-O, CodeResources-level for a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignOutcome {
    pub sha1: Option<Vec<u8>>,
    pub sha256: Vec<u8>,
    pub code_resources: Option<Vec<u8>>,
}

/// An opened Mach-O image.
pub trait MachOTarget {
    fn inject_dylib(&mut self, weak: bool, path: &str) -> Result<()>;

    /// `true` when the existing signature is valid.
    fn check_signature(&self) -> bool;

    /// Log a human-readable description. Cannot fail.
    fn print_info(&self);

    fn sign(
        &mut self,
        assets: &SigningAssets,
        force: bool,
        bundle_id: Option<&str>,
    ) -> Result<SignOutcome>;
}

/// Factory for the three collaborators.
pub trait Backend {
    fn load_assets(&self, params: &AssetParams) -> Result<SigningAssets>;

    fn open_macho(&self, path: &Path) -> Result<Box<dyn MachOTarget>>;

    fn sign_folder(&self, assets: &SigningAssets, job: &FolderJob<'_>) -> Result<SignOutcome>;
}

/// Pure-Rust collaborators staging through one request's workspace.
#[derive(Debug, Clone)]
pub struct NativeBackend {
    staging: Staging,
    folders: FolderSigner,
}

impl NativeBackend {
    pub fn new(staging: Staging) -> Self {
        Self {
            folders: FolderSigner::new(staging.clone()),
            staging,
        }
    }
}

impl Backend for NativeBackend {
    fn load_assets(&self, params: &AssetParams) -> Result<SigningAssets> {
        SigningAssets::load(params)
    }

    fn open_macho(&self, path: &Path) -> Result<Box<dyn MachOTarget>> {
        Ok(Box::new(open_target(path, &self.staging)?))
    }

    fn sign_folder(&self, assets: &SigningAssets, job: &FolderJob<'_>) -> Result<SignOutcome> {
        self.folders.sign_folder(assets, job)
    }
}
