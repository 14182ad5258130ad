//! Recursive signing of an application bundle.

use super::code_resources::{CodeResourcesBuilder, CODE_RESOURCES, CODE_SIGNATURE_DIR};
use crate::backend::{FolderJob, SignOutcome};
use crate::crypto::{DigestPolicy, SigningAssets};
use crate::macho::{MachOImage, SignOptions};
use crate::workspace::Staging;
use crate::{Error, Result};
use log::{debug, info, warn};
use plist::{Dictionary, Value};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const BUNDLE_EXTENSIONS: &[&str] = &["app", "appex", "framework", "xctest"];
const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";
const MACHO_MAGICS: &[[u8; 4]] = &[
    [0xfe, 0xed, 0xfa, 0xce],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xca, 0xfe, 0xba, 0xbe],
];

/// Signs bundles with one shared set of signing assets.
#[derive(Debug, Clone)]
pub struct FolderSigner {
    staging: Staging,
}

impl FolderSigner {
    pub fn new(staging: Staging) -> Self {
        Self { staging }
    }

    /// Sign the bundle at `job.path` and every bundle nested in it.
    ///
    /// The outcome carries the top-level CodeResources and its digests.
    pub fn sign_folder(&self, assets: &SigningAssets, job: &FolderJob<'_>) -> Result<SignOutcome> {
        let app = if job.top_level {
            locate_app(job.path)?
        } else {
            job.path.to_path_buf()
        };
        info!(">>> Signing: {}", app.display());

        let injected = if job.dylibs.is_empty() {
            None
        } else {
            Some(self.inject_dylibs(&app, job)?)
        };

        if job.top_level {
            apply_overrides(&app, job)?;
        }

        let mut main = None;
        if let Some((image, copies)) = injected {
            for (source, dest) in copies {
                if source != dest {
                    fs::copy(&source, &dest)?;
                    debug!("copied {} into bundle", source.display());
                }
            }
            main = Some(image);
        }

        for nested in nested_bundles(&app) {
            self.seal_bundle(&nested, assets, job.force, None)?;
        }
        self.seal_bundle(&app, assets, job.force, main)
    }

    /// Inject every dylib into the in-memory main executable.
    ///
    /// Returns the edited image with the copies still to make. Nothing is
    /// written, so a failed injection leaves the bundle untouched.
    fn inject_dylibs(
        &self,
        app: &Path,
        job: &FolderJob<'_>,
    ) -> Result<(MachOImage, Vec<(PathBuf, PathBuf)>)> {
        let info = read_info(app)?;
        let executable = executable_name(&info)
            .ok_or_else(|| Error::Bundle("Info.plist has no CFBundleExecutable".into()))?;
        let mut image = MachOImage::open(app.join(&executable), self.staging.clone())?;

        let mut copies = Vec::with_capacity(job.dylibs.len());
        for dylib in job.dylibs {
            let source = Path::new(dylib);
            let name = source
                .file_name()
                .ok_or_else(|| Error::injection(dylib, Error::Bundle("no file name".into())))?;
            if !source.is_file() {
                return Err(Error::injection(
                    dylib,
                    Error::Bundle(format!("{} not found", source.display())),
                ));
            }
            let load_path = format!("@executable_path/{}", name.to_string_lossy());
            image
                .inject_dylib(job.weak_inject, &load_path)
                .map_err(|e| Error::injection(dylib, e))?;
            copies.push((source.to_path_buf(), app.join(name)));
        }
        Ok((image, copies))
    }

    /// Sign loose Mach-O files, write CodeResources, then sign the main
    /// executable over both.
    fn seal_bundle(
        &self,
        dir: &Path,
        assets: &SigningAssets,
        force: bool,
        main: Option<MachOImage>,
    ) -> Result<SignOutcome> {
        let info_bytes = fs::read(dir.join("Info.plist")).map_err(|e| {
            Error::Bundle(format!("{}: cannot read Info.plist: {e}", dir.display()))
        })?;
        let info: Dictionary = plist::from_bytes(&info_bytes)?;
        let executable = executable_name(&info);
        let identifier = info
            .get("CFBundleIdentifier")
            .and_then(Value::as_string)
            .map(str::to_owned);
        debug!("sealing {} ({:?})", dir.display(), identifier);

        if let Some(profile) = assets.provisioning_profile() {
            if has_extension(dir, "app") || has_extension(dir, "appex") {
                fs::write(dir.join(EMBEDDED_PROFILE), profile.raw())?;
            }
        }

        for path in loose_machos(dir, executable.as_deref())? {
            info!(">>> Signing: {}", path.display());
            MachOImage::open(&path, self.staging.clone())?.sign(assets, force, None)?;
        }

        let code_resources = {
            let mut builder = CodeResourcesBuilder::new(dir);
            builder.scan()?;
            builder.build()?
        };
        let seal_dir = dir.join(CODE_SIGNATURE_DIR);
        fs::create_dir_all(&seal_dir)?;
        fs::write(seal_dir.join(CODE_RESOURCES), &code_resources)?;
        if let Some(name) = dir.file_name() {
            self.staging.dump(
                &format!("{}.CodeResources", name.to_string_lossy()),
                &code_resources,
            );
        }

        let mut image = match (main, &executable) {
            (Some(image), _) => image,
            (None, Some(name)) => MachOImage::open(dir.join(name), self.staging.clone())?,
            (None, None) => {
                return Err(Error::Bundle(format!(
                    "{} has no CFBundleExecutable",
                    dir.display()
                )))
            }
        };
        image.sign_with(
            assets,
            &SignOptions {
                force,
                identifier: identifier.as_deref(),
                info_plist: Some(&info_bytes),
                code_resources: Some(&code_resources),
            },
        )?;

        Ok(SignOutcome {
            sha1: match assets.digests() {
                DigestPolicy::Sha1AndSha256 => Some(Sha1::digest(&code_resources).to_vec()),
                DigestPolicy::Sha256Only => None,
            },
            sha256: Sha256::digest(&code_resources).to_vec(),
            code_resources: Some(code_resources),
        })
    }
}

/// The `.app` to sign: the folder itself, or the app inside `Payload/`.
fn locate_app(path: &Path) -> Result<PathBuf> {
    if path.join("Info.plist").is_file() {
        return Ok(path.to_path_buf());
    }
    for root in [path.join("Payload"), path.to_path_buf()] {
        let Ok(entries) = fs::read_dir(&root) else {
            continue;
        };
        let mut apps: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir() && has_extension(p, "app"))
            .collect();
        apps.sort();
        if let Some(app) = apps.into_iter().next() {
            return Ok(app);
        }
    }
    Err(Error::Bundle(format!(
        "no application bundle found in {}",
        path.display()
    )))
}

fn apply_overrides(app: &Path, job: &FolderJob<'_>) -> Result<()> {
    if job.bundle_id.is_none() && job.bundle_name.is_none() && job.bundle_version.is_none() {
        return Ok(());
    }
    let mut info = read_info(app)?;
    let old_id = info
        .get("CFBundleIdentifier")
        .and_then(Value::as_string)
        .map(str::to_owned);

    if let Some(id) = job.bundle_id {
        info!("BundleId: {} -> {id}", old_id.as_deref().unwrap_or("<none>"));
        info.insert("CFBundleIdentifier".into(), Value::String(id.into()));
    }
    if let Some(name) = job.bundle_name {
        info!("BundleName: {name}");
        info.insert("CFBundleDisplayName".into(), Value::String(name.into()));
        info.insert("CFBundleName".into(), Value::String(name.into()));
    }
    if let Some(version) = job.bundle_version {
        info!("BundleVersion: {version}");
        info.insert("CFBundleVersion".into(), Value::String(version.into()));
        info.insert(
            "CFBundleShortVersionString".into(),
            Value::String(version.into()),
        );
    }
    plist::to_file_xml(app.join("Info.plist"), &info)?;

    if let (Some(old), Some(new)) = (old_id, job.bundle_id) {
        for nested in nested_bundles(app) {
            rename_nested_id(&nested, &old, new)?;
        }
    }
    Ok(())
}

fn rename_nested_id(dir: &Path, old: &str, new: &str) -> Result<()> {
    let path = dir.join("Info.plist");
    if !path.is_file() {
        return Ok(());
    }
    let mut info: Dictionary = plist::from_file(&path)?;
    let Some(current) = info.get("CFBundleIdentifier").and_then(Value::as_string) else {
        return Ok(());
    };
    let Some(rest) = current.strip_prefix(old) else {
        return Ok(());
    };
    let renamed = format!("{new}{rest}");
    debug!("{}: {current} -> {renamed}", dir.display());
    info.insert("CFBundleIdentifier".into(), Value::String(renamed));
    plist::to_file_xml(&path, &info)?;
    Ok(())
}

fn read_info(dir: &Path) -> Result<Dictionary> {
    let path = dir.join("Info.plist");
    plist::from_file(&path)
        .map_err(|e| Error::Bundle(format!("{}: {e}", path.display())))
}

fn executable_name(info: &Dictionary) -> Option<String> {
    info.get("CFBundleExecutable")
        .and_then(Value::as_string)
        .map(str::to_owned)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn is_bundle_dir(path: &Path) -> bool {
    BUNDLE_EXTENSIONS.iter().any(|ext| has_extension(path, ext))
}

/// Nested bundles under `app`, deepest first.
fn nested_bundles(app: &Path) -> Vec<PathBuf> {
    let mut found: Vec<(usize, PathBuf)> = WalkDir::new(app)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && is_bundle_dir(e.path()))
        .map(|e| (e.depth(), e.into_path()))
        .collect();
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    found.into_iter().map(|(_, path)| path).collect()
}

/// Mach-O files owned by `dir`, excluding nested bundles and the main
/// executable.
fn loose_machos(dir: &Path, executable: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_bundle_dir(e.path())));
    for entry in walker {
        let entry = entry.map_err(|e| Error::Bundle(format!("cannot walk bundle: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).ok();
        if relative.is_some_and(|r| r.starts_with(CODE_SIGNATURE_DIR)) {
            continue;
        }
        if executable.is_some_and(|name| relative == Some(Path::new(name))) {
            continue;
        }
        if is_macho(entry.path()) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

fn is_macho(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match fs::File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => MACHO_MAGICS.contains(&magic),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                warn!("cannot read {}: {e}", path.display());
            }
            false
        }
    }
}
