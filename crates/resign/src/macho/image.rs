//! One Mach-O file on disk, held in memory until it is signed.
//!
//! Dylib injection only edits the in-memory copy. Nothing reaches the disk
//! until [`MachOImage::sign`] commits the signed bytes through a staged
//! temp file, so a failed injection or signing pass leaves the original
//! file as it was.

use super::fat::{self, Container};
use super::layout::SliceLayout;
use super::signature::{self, SignatureSummary, SliceInput};
use crate::backend::{MachOTarget, SignOutcome};
use crate::crypto::{DigestPolicy, SigningAssets, SigningMode};
use crate::workspace::Staging;
use crate::{Error, Result};
use log::{debug, info, warn};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Per-call signing options.
#[derive(Debug, Clone, Default)]
pub struct SignOptions<'a> {
    pub force: bool,
    /// Identifier override. Falls back to the existing identifier, then the
    /// file name.
    pub identifier: Option<&'a str>,
    /// `Info.plist` bytes sealed in special slot 1.
    pub info_plist: Option<&'a [u8]>,
    /// `CodeResources` bytes sealed in special slot 3.
    pub code_resources: Option<&'a [u8]>,
}

#[derive(Debug)]
pub struct MachOImage {
    path: PathBuf,
    data: Vec<u8>,
    dirty: bool,
    staging: Staging,
}

impl MachOImage {
    /// Read and validate every slice of the file at `path`.
    pub fn open(path: impl Into<PathBuf>, staging: Staging) -> Result<Self> {
        let path = path.into();
        let data = fs::read(&path)?;
        let (container, parts) = fat::slices(&data)?;
        for part in parts {
            SliceLayout::parse(part)?;
        }
        debug!(
            "opened {} ({} bytes, {})",
            path.display(),
            data.len(),
            if container.is_fat() { "universal" } else { "thin" }
        );
        Ok(Self {
            path,
            data,
            dirty: false,
            staging,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current in-memory bytes, including uncommitted edits.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the in-memory image differs from the file on disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Add a dylib load command to every slice that does not link `dylib`.
    pub fn inject_dylib(&mut self, weak: bool, dylib: &str) -> Result<()> {
        info!(">>> Inject dylib: {dylib}{}", if weak { " (weak)" } else { "" });
        let (_, ranges) = fat::slice_ranges(&self.data)?;

        let mut pending = Vec::new();
        for range in ranges {
            let layout = SliceLayout::parse(&self.data[range.clone()])?;
            if layout.links(dylib) {
                debug!("slice at {:#x} already links {dylib}", range.start);
                continue;
            }
            if layout.signature.is_some() {
                debug!("slice at {:#x} carries a signature that will be replaced", range.start);
            }
            pending.push((range, layout));
        }

        // Every slice must have room before any slice is touched.
        let mut edited = self.data.clone();
        for (range, layout) in &pending {
            super::layout::add_dylib(&mut edited[range.clone()], layout, dylib, weak)?;
        }
        if !pending.is_empty() {
            self.data = edited;
            self.dirty = true;
        }
        Ok(())
    }

    /// Verify every slice. Returns one summary per slice.
    pub fn verify(&self) -> Result<Vec<SignatureSummary>> {
        let bundle_dir = self.bundle_dir();
        let (_, parts) = fat::slices(&self.data)?;
        parts
            .into_iter()
            .map(|part| signature::verify_slice(part, bundle_dir.as_deref()))
            .collect()
    }

    /// `true` when every slice carries a signature that verifies.
    pub fn check_signature(&self) -> bool {
        match self.verify() {
            Ok(summaries) => {
                for summary in &summaries {
                    info!(
                        "signature OK: {} ({})",
                        summary.identifier,
                        if summary.adhoc { "ad-hoc" } else { "identity" }
                    );
                }
                true
            }
            Err(e) => {
                warn!("signature check failed for {}: {e}", self.path.display());
                false
            }
        }
    }

    /// Log the layout, linked dylibs and signature of every slice.
    pub fn print_info(&self) {
        info!("File: {}", self.path.display());
        let (container, parts) = match fat::slices(&self.data) {
            Ok(split) => split,
            Err(e) => {
                warn!("cannot read {}: {e}", self.path.display());
                return;
            }
        };
        if let Container::Fat(entries) = &container {
            info!("Universal binary, {} slices", entries.len());
        }

        for part in parts {
            let layout = match SliceLayout::parse(part) {
                Ok(layout) => layout,
                Err(e) => {
                    warn!("cannot parse slice: {e}");
                    continue;
                }
            };
            info!(
                "Slice: cputype={:#x} filetype={} {}-bit, {} load commands, {} bytes",
                layout.cputype,
                layout.filetype,
                if layout.is_64 { 64 } else { 32 },
                layout.ncmds,
                part.len()
            );
            for dylib in &layout.dylibs {
                info!("  {}{}", dylib.path, if dylib.weak { " (weak)" } else { "" });
            }

            let summary = match signature::verify_slice(part, None) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    debug!("signature does not verify: {e}");
                    signature::read_signature(part).ok().flatten()
                }
            };
            match summary {
                Some(summary) => log_summary(&summary),
                None => info!("  Not signed"),
            }
        }
    }

    /// Sign every slice and commit the result to disk.
    pub fn sign(
        &mut self,
        assets: &SigningAssets,
        force: bool,
        bundle_id: Option<&str>,
    ) -> Result<SignOutcome> {
        self.sign_with(
            assets,
            &SignOptions {
                force,
                identifier: bundle_id,
                ..SignOptions::default()
            },
        )
    }

    pub fn sign_with(
        &mut self,
        assets: &SigningAssets,
        options: &SignOptions<'_>,
    ) -> Result<SignOutcome> {
        let identifier = self.resolve_identifier(options.identifier)?;

        if !options.force && !self.dirty && self.already_signed(assets, &identifier) {
            info!(
                "{} is already signed as {identifier}, skipping",
                self.path.display()
            );
            return Ok(self.outcome(assets.digests()));
        }

        let input = SliceInput {
            identifier: &identifier,
            info_plist: options.info_plist,
            code_resources: options.code_resources,
        };
        let (container, mut slices) = fat::split(&self.data)?;
        let name = self.file_name();
        for (i, slice) in slices.iter_mut().enumerate() {
            let superblob = signature::sign_slice(slice, assets, &input)?;
            debug!(
                "signed slice {i} of {}: {} byte signature",
                self.path.display(),
                superblob.len()
            );
            self.staging
                .dump(&format!("{name}.{i}.superblob"), &superblob);
        }

        self.data = fat::join(&container, slices);
        self.commit()?;
        self.dirty = false;
        Ok(self.outcome(assets.digests()))
    }

    fn already_signed(&self, assets: &SigningAssets, identifier: &str) -> bool {
        let summaries = match self.verify() {
            Ok(summaries) => summaries,
            Err(e) => {
                debug!("existing signature rejected: {e}");
                return false;
            }
        };
        summaries.iter().all(|s| {
            s.identifier == identifier
                && s.adhoc == (assets.mode() == SigningMode::AdHoc)
                && s.team_id.as_deref() == assets.team_id()
        })
    }

    fn resolve_identifier(&self, requested: Option<&str>) -> Result<String> {
        if let Some(id) = requested.filter(|id| !id.is_empty()) {
            return Ok(id.to_owned());
        }
        let (_, parts) = fat::slices(&self.data)?;
        if let Some(summary) = parts
            .first()
            .and_then(|part| signature::read_signature(part).ok().flatten())
        {
            return Ok(summary.identifier);
        }
        Ok(self.file_name())
    }

    fn bundle_dir(&self) -> Option<PathBuf> {
        let parent = self.path.parent()?;
        parent
            .join("Info.plist")
            .is_file()
            .then(|| parent.to_path_buf())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn outcome(&self, digests: DigestPolicy) -> SignOutcome {
        SignOutcome {
            sha1: match digests {
                DigestPolicy::Sha1AndSha256 => Some(Sha1::digest(&self.data).to_vec()),
                DigestPolicy::Sha256Only => None,
            },
            sha256: Sha256::digest(&self.data).to_vec(),
            code_resources: None,
        }
    }

    /// Replace the file on disk through a temp file in the staging dir.
    fn commit(&self) -> Result<()> {
        let permissions = fs::metadata(&self.path)?.permissions();
        let mut staged = NamedTempFile::new_in(self.staging.dir())?;
        staged.write_all(&self.data)?;
        staged.flush()?;
        fs::set_permissions(staged.path(), permissions)?;

        if let Err(e) = staged.persist(&self.path) {
            debug!("rename into place failed ({}), copying", e.error);
            fs::copy(e.file.path(), &self.path)?;
        }
        debug!("wrote {} ({} bytes)", self.path.display(), self.data.len());
        Ok(())
    }
}

fn log_summary(summary: &SignatureSummary) {
    info!("  Identifier: {}", summary.identifier);
    info!(
        "  TeamID:     {}",
        summary.team_id.as_deref().unwrap_or("not set")
    );
    info!(
        "  Signature:  {} {:?}",
        if summary.adhoc { "ad-hoc" } else { "identity" },
        summary.kinds
    );
    info!("  CDHash:     {}", hex::encode(&summary.cdhash));
    for name in &summary.signer_names {
        info!("  Signer:     {name}");
    }
    if let Some(entitlements) = &summary.entitlements {
        info!("  Entitlements:\n{}", String::from_utf8_lossy(entitlements));
    }
}

impl MachOTarget for MachOImage {
    fn inject_dylib(&mut self, weak: bool, path: &str) -> Result<()> {
        MachOImage::inject_dylib(self, weak, path)
    }

    fn check_signature(&self) -> bool {
        MachOImage::check_signature(self)
    }

    fn print_info(&self) {
        MachOImage::print_info(self)
    }

    fn sign(
        &mut self,
        assets: &SigningAssets,
        force: bool,
        bundle_id: Option<&str>,
    ) -> Result<SignOutcome> {
        MachOImage::sign(self, assets, force, bundle_id)
    }
}

/// Load a whole image for editing, mapping failures to the image path.
pub(crate) fn open_target(path: &Path, staging: &Staging) -> Result<MachOImage> {
    MachOImage::open(path, staging.clone()).map_err(|e| Error::InvalidImage {
        path: path.to_path_buf(),
        source: Box::new(e),
    })
}
