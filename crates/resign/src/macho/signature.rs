//! Creating and checking the embedded signature of one slice.

use super::layout::{self, SliceLayout};
use crate::codesign::blob::{
    blob_payload, der_entitlements_blob, empty_requirements_blob, entitlements_blob,
    signature_blob,
};
use crate::codesign::constants::*;
use crate::codesign::der::entitlements_to_der;
use crate::codesign::{CodeDirectory, CodeDirectoryBuilder, HashKind, SuperBlob, SuperBlobBuilder};
use crate::crypto::cms::{self, CdHash};
use crate::crypto::{SigningAssets, SigningMode};
use crate::{Error, Result};
use std::fs;
use std::path::Path;

const SUPERBLOB_FIXED: usize = 12;
const INDEX_ENTRY: usize = 8;

/// Per-image inputs of a signing pass.
#[derive(Debug, Clone, Copy)]
pub struct SliceInput<'a> {
    pub identifier: &'a str,
    pub info_plist: Option<&'a [u8]>,
    pub code_resources: Option<&'a [u8]>,
}

/// Sign `slice` in place and return the embedded SuperBlob.
///
/// The load commands are rewritten for the final signature size before any
/// page is hashed, so the CodeDirectory covers the bytes that ship.
pub fn sign_slice(
    slice: &mut Vec<u8>,
    assets: &SigningAssets,
    input: &SliceInput<'_>,
) -> Result<Vec<u8>> {
    let layout = SliceLayout::parse(slice)?;
    let code_end = layout.code_end(slice.len());
    let dataoff = layout::align(code_end, 16);
    let is_main = layout.is_executable();

    let requirements = empty_requirements_blob();
    let (entitlements, der_entitlements) = match assets.entitlements_xml() {
        Some(xml) if is_main => (
            Some(entitlements_blob(xml)),
            Some(der_entitlements_blob(&entitlements_to_der(xml)?)),
        ),
        _ => (None, None),
    };

    let mut exec_flags = 0;
    if is_main {
        exec_flags |= CS_EXECSEG_MAIN_BINARY;
        if assets.allows_debugging() {
            exec_flags |= CS_EXECSEG_ALLOW_UNSIGNED;
        }
    }
    let plan = Plan {
        input,
        requirements: &requirements,
        entitlements: entitlements.as_deref(),
        der_entitlements: der_entitlements.as_deref(),
        text: layout
            .text
            .map(|t| (t.fileoff, t.filesize))
            .unwrap_or_default(),
        exec_flags,
        team_id: match assets.mode() {
            SigningMode::Identity => assets.team_id(),
            SigningMode::AdHoc => None,
        },
        adhoc: assets.mode() == SigningMode::AdHoc,
    };

    slice.truncate(code_end);
    slice.resize(dataoff, 0);

    let kinds = assets.digests().kinds();
    let reserved = {
        let builder = plan.directory(slice.as_slice());
        let directories: usize = kinds.iter().map(|k| builder.encoded_len(*k)).sum();
        let optional = [&entitlements, &der_entitlements]
            .iter()
            .filter_map(|b| b.as_ref().map(Vec::len))
            .collect::<Vec<_>>();
        let entries = kinds.len() + 2 + optional.len();
        let total = SUPERBLOB_FIXED
            + entries * INDEX_ENTRY
            + directories
            + requirements.len()
            + optional.iter().sum::<usize>()
            + 8
            + assets.cms_size_hint();
        layout::align(total, 16)
    };

    layout::reserve_signature(slice, &layout, dataoff, reserved)?;

    let directories: Vec<(HashKind, Vec<u8>)> = {
        let builder = plan.directory(&slice[..dataoff]);
        kinds.iter().map(|k| (*k, builder.build(*k))).collect()
    };
    let cdhashes: Vec<CdHash> = directories
        .iter()
        .map(|(kind, cd)| CdHash {
            kind: *kind,
            digest: kind.digest(cd),
        })
        .collect();
    let cms = assets.sign_code_directory(&directories[0].1, &cdhashes)?;

    let mut superblob = SuperBlobBuilder::new()
        .blob(CSSLOT_REQUIREMENTS, requirements.clone())
        .blob(CSSLOT_SIGNATURESLOT, signature_blob(&cms));
    for (i, (_, cd)) in directories.into_iter().enumerate() {
        let slot = match i {
            0 => CSSLOT_CODEDIRECTORY,
            n => CSSLOT_ALTERNATE_CODEDIRECTORIES + n as u32 - 1,
        };
        superblob = superblob.blob(slot, cd);
    }
    if let Some(blob) = entitlements.clone() {
        superblob = superblob.blob(CSSLOT_ENTITLEMENTS, blob);
    }
    if let Some(blob) = der_entitlements.clone() {
        superblob = superblob.blob(CSSLOT_DER_ENTITLEMENTS, blob);
    }
    let superblob = superblob.build();

    if superblob.len() > reserved {
        return Err(Error::MachO(format!(
            "signature of {} bytes exceeds reserved {reserved}",
            superblob.len()
        )));
    }
    slice[dataoff..dataoff + superblob.len()].copy_from_slice(&superblob);
    Ok(superblob)
}

/// Everything except the code pages that goes into a CodeDirectory.
struct Plan<'p> {
    input: &'p SliceInput<'p>,
    requirements: &'p [u8],
    entitlements: Option<&'p [u8]>,
    der_entitlements: Option<&'p [u8]>,
    text: (u64, u64),
    exec_flags: u64,
    team_id: Option<&'p str>,
    adhoc: bool,
}

impl Plan<'_> {
    fn directory<'c>(&self, code: &'c [u8]) -> CodeDirectoryBuilder<'c> {
        let mut builder = CodeDirectoryBuilder::new(self.input.identifier, code)
            .special_slot(CSSLOT_REQUIREMENTS, self.requirements.to_vec())
            .exec_segment(self.text.0, self.text.1, self.exec_flags);
        if let Some(team) = self.team_id {
            builder = builder.team_id(team);
        }
        if self.adhoc {
            builder = builder.flags(CS_ADHOC);
        }
        if let Some(info) = self.input.info_plist {
            builder = builder.special_slot(CSSLOT_INFOSLOT, info.to_vec());
        }
        if let Some(resources) = self.input.code_resources {
            builder = builder.special_slot(CSSLOT_RESOURCEDIR, resources.to_vec());
        }
        if let Some(blob) = self.entitlements {
            builder = builder.special_slot(CSSLOT_ENTITLEMENTS, blob.to_vec());
        }
        if let Some(blob) = self.der_entitlements {
            builder = builder.special_slot(CSSLOT_DER_ENTITLEMENTS, blob.to_vec());
        }
        builder
    }
}

/// What an existing signature says about the slice.
#[derive(Debug, Clone, Default)]
pub struct SignatureSummary {
    pub identifier: String,
    pub team_id: Option<String>,
    pub adhoc: bool,
    pub kinds: Vec<HashKind>,
    pub cdhash: Vec<u8>,
    pub entitlements: Option<Vec<u8>>,
    pub signer_names: Vec<String>,
}

/// Read the signature without validating it. `None` when unsigned.
pub fn read_signature(slice: &[u8]) -> Result<Option<SignatureSummary>> {
    let layout = SliceLayout::parse(slice)?;
    let Some(superblob) = embedded_superblob(slice, &layout)? else {
        return Ok(None);
    };
    summarize(&superblob).map(Some)
}

/// Check every CodeDirectory, blob hash and the CMS signature of `slice`.
///
/// `bundle_dir` is the directory holding `Info.plist` and
/// `_CodeSignature/CodeResources` when the slice belongs to a bundle.
pub fn verify_slice(slice: &[u8], bundle_dir: Option<&Path>) -> Result<SignatureSummary> {
    let layout = SliceLayout::parse(slice)?;
    let signature = layout
        .signature
        .ok_or_else(|| Error::MachO("not signed".into()))?;
    let superblob = embedded_superblob(slice, &layout)?
        .ok_or_else(|| Error::MachO("not signed".into()))?;

    let raw_directories = superblob.code_directories();
    if raw_directories.is_empty() {
        return Err(Error::MachO("signature has no CodeDirectory".into()));
    }

    for raw in &raw_directories {
        let cd = CodeDirectory::parse(raw)?;
        if cd.code_limit != signature.dataoff as usize {
            return Err(Error::MachO(format!(
                "code limit {} does not reach signature at {}",
                cd.code_limit, signature.dataoff
            )));
        }
        if !cd.matches_code(slice) {
            return Err(Error::MachO(format!("{:?} page hash mismatch", cd.kind)));
        }

        for slot in [
            CSSLOT_REQUIREMENTS,
            CSSLOT_ENTITLEMENTS,
            CSSLOT_DER_ENTITLEMENTS,
        ] {
            let stored = cd.special_hash(slot as usize).is_some();
            match superblob.get(slot) {
                Some(blob) if !cd.matches_special(slot as usize, blob) => {
                    return Err(Error::MachO(format!("slot {slot} hash mismatch")))
                }
                None if stored => {
                    return Err(Error::MachO(format!("slot {slot} blob missing")))
                }
                _ => {}
            }
        }

        if let Some(dir) = bundle_dir {
            check_file_slot(&cd, CSSLOT_INFOSLOT, &dir.join("Info.plist"))?;
            check_file_slot(
                &cd,
                CSSLOT_RESOURCEDIR,
                &dir.join("_CodeSignature").join("CodeResources"),
            )?;
        }
    }

    let mut summary = summarize(&superblob)?;
    if !summary.adhoc {
        let cms = superblob
            .cms()
            .ok_or_else(|| Error::Cms("identity signature without CMS".into()))?;
        summary.signer_names = cms::verify_detached(cms, raw_directories[0])?.signer_names;
    }
    Ok(summary)
}

fn check_file_slot(cd: &CodeDirectory<'_>, slot: u32, path: &Path) -> Result<()> {
    if cd.special_hash(slot as usize).is_none() {
        return Ok(());
    }
    let content = fs::read(path)
        .map_err(|e| Error::MachO(format!("cannot read sealed {}: {e}", path.display())))?;
    if !cd.matches_special(slot as usize, &content) {
        return Err(Error::MachO(format!("{} was modified", path.display())));
    }
    Ok(())
}

fn embedded_superblob<'a>(
    slice: &'a [u8],
    layout: &SliceLayout,
) -> Result<Option<SuperBlob<'a>>> {
    let Some(sig) = layout.signature else {
        return Ok(None);
    };
    let start = sig.dataoff as usize;
    let end = start + sig.datasize as usize;
    let bytes = slice
        .get(start..end)
        .ok_or_else(|| Error::MachO("code signature out of bounds".into()))?;
    SuperBlob::parse(bytes).map(Some)
}

fn summarize(superblob: &SuperBlob<'_>) -> Result<SignatureSummary> {
    let raw = superblob
        .code_directories()
        .first()
        .copied()
        .ok_or_else(|| Error::MachO("signature has no CodeDirectory".into()))?;
    let primary = CodeDirectory::parse(raw)?;
    let kinds = superblob
        .code_directories()
        .iter()
        .filter_map(|raw| CodeDirectory::parse(raw).ok().map(|cd| cd.kind))
        .collect();

    Ok(SignatureSummary {
        adhoc: primary.is_adhoc(),
        cdhash: primary.cdhash(),
        identifier: primary.identifier,
        team_id: primary.team_id,
        kinds,
        entitlements: superblob
            .get(CSSLOT_ENTITLEMENTS)
            .map(|blob| blob_payload(blob).to_vec()),
        signer_names: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::assets::tests::test_identity;
    use crate::crypto::DigestPolicy;
    use crate::macho::layout::tests::synthetic_macho;
    use goblin::mach::header::{MH_DYLIB, MH_EXECUTE};

    const ENTITLEMENTS: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>get-task-allow</key><true/></dict></plist>"#;

    fn input(identifier: &str) -> SliceInput<'_> {
        SliceInput {
            identifier,
            info_plist: None,
            code_resources: None,
        }
    }

    #[test]
    fn test_adhoc_sign_and_verify() {
        let mut slice = synthetic_macho(MH_EXECUTE);
        let assets = SigningAssets::adhoc(DigestPolicy::Sha1AndSha256)
            .entitlements(ENTITLEMENTS.to_vec());
        sign_slice(&mut slice, &assets, &input("com.example.tool")).unwrap();

        let summary = verify_slice(&slice, None).unwrap();
        assert!(summary.adhoc);
        assert_eq!(summary.identifier, "com.example.tool");
        assert_eq!(summary.kinds, vec![HashKind::Sha1, HashKind::Sha256]);
        assert_eq!(summary.entitlements.as_deref(), Some(ENTITLEMENTS));
    }

    #[test]
    fn test_identity_sign_and_verify() {
        let mut slice = synthetic_macho(MH_EXECUTE);
        let assets =
            SigningAssets::with_identity(test_identity("ABCDE12345"), DigestPolicy::Sha256Only);
        sign_slice(&mut slice, &assets, &input("com.example.app")).unwrap();

        let summary = verify_slice(&slice, None).unwrap();
        assert!(!summary.adhoc);
        assert_eq!(summary.team_id.as_deref(), Some("ABCDE12345"));
        assert_eq!(summary.kinds, vec![HashKind::Sha256]);
        assert_eq!(
            summary.signer_names,
            vec!["Apple Development: Test Signer".to_string()]
        );
    }

    #[test]
    fn test_resign_replaces_signature() {
        let mut slice = synthetic_macho(MH_EXECUTE);
        let assets = SigningAssets::adhoc(DigestPolicy::Sha256Only);
        sign_slice(&mut slice, &assets, &input("first")).unwrap();
        let first_len = slice.len();
        sign_slice(&mut slice, &assets, &input("second")).unwrap();

        assert_eq!(slice.len(), first_len);
        assert_eq!(verify_slice(&slice, None).unwrap().identifier, "second");
    }

    #[test]
    fn test_tampering_detected() {
        let mut slice = synthetic_macho(MH_EXECUTE);
        let assets = SigningAssets::adhoc(DigestPolicy::Sha256Only);
        sign_slice(&mut slice, &assets, &input("t")).unwrap();
        slice[0x1010] ^= 0xff;
        assert!(verify_slice(&slice, None).is_err());
    }

    #[test]
    fn test_dylib_gets_no_entitlements() {
        let mut slice = synthetic_macho(MH_DYLIB);
        let assets =
            SigningAssets::adhoc(DigestPolicy::Sha256Only).entitlements(ENTITLEMENTS.to_vec());
        sign_slice(&mut slice, &assets, &input("lib")).unwrap();
        assert!(verify_slice(&slice, None).unwrap().entitlements.is_none());
    }

    #[test]
    fn test_unsigned_reads_none() {
        let slice = synthetic_macho(MH_EXECUTE);
        assert!(read_signature(&slice).unwrap().is_none());
        assert!(verify_slice(&slice, None).is_err());
    }

    #[test]
    fn test_sealed_files_checked() {
        let dir = tempfile::tempdir().unwrap();
        let info = b"<plist>info</plist>".to_vec();
        fs::write(dir.path().join("Info.plist"), &info).unwrap();

        let mut slice = synthetic_macho(MH_EXECUTE);
        let assets = SigningAssets::adhoc(DigestPolicy::Sha256Only);
        let input = SliceInput {
            identifier: "app",
            info_plist: Some(&info),
            code_resources: None,
        };
        sign_slice(&mut slice, &assets, &input).unwrap();
        assert!(verify_slice(&slice, Some(dir.path())).is_ok());

        fs::write(dir.path().join("Info.plist"), b"changed").unwrap();
        assert!(verify_slice(&slice, Some(dir.path())).is_err());
    }
}
