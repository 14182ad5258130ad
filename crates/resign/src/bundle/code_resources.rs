//! `_CodeSignature/CodeResources` generation.
//!
//! The manifest lists a SHA-1 (`files`) and SHA-1 plus SHA-256 (`files2`)
//! digest for every file of the bundle except the main executable, which
//! carries its own embedded signature. Files of nested bundles stay listed
//! in the parent manifest after the nested bundle has been sealed.

use crate::codesign::HashKind;
use crate::{Error, Result};
use log::{debug, warn};
use plist::{Dictionary, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const CODE_SIGNATURE_DIR: &str = "_CodeSignature";
pub const CODE_RESOURCES: &str = "CodeResources";

#[derive(Debug, Clone)]
struct FileEntry {
    sha1: Vec<u8>,
    sha256: Vec<u8>,
    symlink_target: Option<String>,
}

impl FileEntry {
    fn of(content: &[u8], symlink_target: Option<String>) -> Self {
        Self {
            sha1: HashKind::Sha1.digest(content),
            sha256: HashKind::Sha256.digest(content),
            symlink_target,
        }
    }
}

/// Collects file digests for one bundle and renders the manifest.
#[derive(Debug)]
pub struct CodeResourcesBuilder {
    bundle_path: PathBuf,
    files: BTreeMap<String, FileEntry>,
    main_executable: Option<String>,
}

fn rule(weight: f64, optional: bool, omit: bool) -> Value {
    let mut dict = Dictionary::new();
    if optional {
        dict.insert("optional".into(), Value::Boolean(true));
    }
    if omit {
        dict.insert("omit".into(), Value::Boolean(true));
    }
    dict.insert("weight".into(), Value::Real(weight));
    Value::Dictionary(dict)
}

fn standard_rules() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert("^.*".into(), Value::Boolean(true));
    rules.insert("^.*\\.lproj/".into(), rule(1000.0, true, false));
    rules.insert("^.*\\.lproj/locversion.plist$".into(), rule(1100.0, false, true));
    rules.insert("^Base\\.lproj/".into(), rule(1010.0, false, false));
    rules.insert("^version.plist$".into(), Value::Boolean(true));
    rules
}

fn standard_rules2() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert("^.*".into(), Value::Boolean(true));
    rules.insert(".*\\.dSYM($|/)".into(), rule(11.0, false, false));
    rules.insert("^(.*/)?\\.DS_Store$".into(), rule(2000.0, false, true));
    rules.insert("^.*\\.lproj/".into(), rule(1000.0, true, false));
    rules.insert("^.*\\.lproj/locversion.plist$".into(), rule(1100.0, false, true));
    rules.insert("^Base\\.lproj/".into(), rule(1010.0, false, false));
    rules.insert("^Info\\.plist$".into(), rule(20.0, false, true));
    rules.insert("^PkgInfo$".into(), rule(20.0, false, true));
    rules.insert("^embedded\\.provisionprofile$".into(), rule(20.0, false, false));
    rules.insert("^version\\.plist$".into(), rule(20.0, false, false));
    rules
}

impl CodeResourcesBuilder {
    pub fn new(bundle_path: impl AsRef<Path>) -> Self {
        let bundle_path = bundle_path.as_ref().to_path_buf();
        let main_executable = match read_main_executable(&bundle_path) {
            Ok(exec) => exec,
            Err(e) => {
                warn!(
                    "cannot read CFBundleExecutable of {}: {e}",
                    bundle_path.display()
                );
                None
            }
        };
        Self {
            bundle_path,
            files: BTreeMap::new(),
            main_executable,
        }
    }

    fn should_exclude(&self, relative_path: &str) -> bool {
        if relative_path == CODE_SIGNATURE_DIR
            || relative_path.starts_with(&format!("{CODE_SIGNATURE_DIR}/"))
        {
            return true;
        }
        self.main_executable.as_deref() == Some(relative_path)
    }

    /// Walk the bundle and digest every file and symlink.
    pub fn scan(&mut self) -> Result<&mut Self> {
        for entry in WalkDir::new(&self.bundle_path)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::Bundle(format!("cannot walk bundle: {e}")))?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.bundle_path)
                .map_err(|e| Error::Bundle(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            if self.should_exclude(&relative) {
                continue;
            }

            let file = if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                let target = target.to_string_lossy().into_owned();
                let content = target.as_bytes().to_vec();
                FileEntry::of(&content, Some(target))
            } else {
                FileEntry::of(&fs::read(entry.path())?, None)
            };
            self.files.insert(relative, file);
        }
        debug!(
            "{} files sealed in {}",
            self.files.len(),
            self.bundle_path.display()
        );
        Ok(self)
    }

    /// Render the manifest as an XML plist.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut files = Dictionary::new();
        let mut files2 = Dictionary::new();

        for (path, entry) in &self.files {
            let optional = path.contains(".lproj/");

            if entry.symlink_target.is_none() {
                let legacy = if optional {
                    let mut dict = Dictionary::new();
                    dict.insert("hash".into(), Value::Data(entry.sha1.clone()));
                    dict.insert("optional".into(), Value::Boolean(true));
                    Value::Dictionary(dict)
                } else {
                    Value::Data(entry.sha1.clone())
                };
                files.insert(path.clone(), legacy);
            }

            if path == "Info.plist" || path == "PkgInfo" || path.ends_with(".DS_Store") {
                continue;
            }
            let mut dict = Dictionary::new();
            match &entry.symlink_target {
                Some(target) => {
                    dict.insert("symlink".into(), Value::String(target.clone()));
                }
                None => {
                    dict.insert("hash".into(), Value::Data(entry.sha1.clone()));
                    dict.insert("hash2".into(), Value::Data(entry.sha256.clone()));
                }
            }
            if optional {
                dict.insert("optional".into(), Value::Boolean(true));
            }
            files2.insert(path.clone(), Value::Dictionary(dict));
        }

        let mut root = Dictionary::new();
        root.insert("files".into(), Value::Dictionary(files));
        root.insert("files2".into(), Value::Dictionary(files2));
        root.insert("rules".into(), Value::Dictionary(standard_rules()));
        root.insert("rules2".into(), Value::Dictionary(standard_rules2()));

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(root))?;
        Ok(buf)
    }
}

fn read_main_executable(bundle_path: &Path) -> Result<Option<String>> {
    let info_plist = bundle_path.join("Info.plist");
    if !info_plist.exists() {
        return Ok(None);
    }
    let value: Value = plist::from_file(&info_plist)?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| Error::Bundle("Info.plist is not a dictionary".into()))?;
    Ok(dict
        .get("CFBundleExecutable")
        .and_then(Value::as_string)
        .map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_info(dir: &Path, executable: &str) {
        let mut dict = Dictionary::new();
        dict.insert(
            "CFBundleExecutable".into(),
            Value::String(executable.into()),
        );
        plist::to_file_xml(dir.join("Info.plist"), &Value::Dictionary(dict)).unwrap();
    }

    fn manifest(builder: &CodeResourcesBuilder) -> Dictionary {
        let value: Value = plist::from_bytes(&builder.build().unwrap()).unwrap();
        value.into_dictionary().unwrap()
    }

    #[test]
    fn test_empty_manifest_has_all_sections() {
        let builder = CodeResourcesBuilder::new("/nonexistent/Empty.app");
        let root = manifest(&builder);
        for key in ["files", "files2", "rules", "rules2"] {
            assert!(root.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_scan_excludes_signature_and_executable() {
        let temp = tempdir().unwrap();
        let app = temp.path().join("Test.app");
        fs::create_dir_all(app.join("_CodeSignature")).unwrap();
        fs::create_dir_all(app.join("en.lproj")).unwrap();
        write_info(&app, "Test");
        fs::write(app.join("Test"), b"binary").unwrap();
        fs::write(app.join("PkgInfo"), b"APPL????").unwrap();
        fs::write(app.join("en.lproj/Main.strings"), b"strings").unwrap();
        fs::write(app.join("_CodeSignature/CodeResources"), b"old").unwrap();

        let mut builder = CodeResourcesBuilder::new(&app);
        builder.scan().unwrap();
        let paths: Vec<_> = builder.files.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["Info.plist", "PkgInfo", "en.lproj/Main.strings"]);

        let root = manifest(&builder);
        let files2 = root.get("files2").and_then(Value::as_dictionary).unwrap();
        assert!(!files2.contains_key("Info.plist"));
        assert!(!files2.contains_key("PkgInfo"));
        let strings = files2
            .get("en.lproj/Main.strings")
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(strings.get("optional").and_then(Value::as_boolean), Some(true));
        assert_eq!(
            strings.get("hash2").and_then(Value::as_data),
            Some(HashKind::Sha256.digest(b"strings").as_slice())
        );

        let files = root.get("files").and_then(Value::as_dictionary).unwrap();
        assert_eq!(
            files.get("PkgInfo").and_then(Value::as_data),
            Some(HashKind::Sha1.digest(b"APPL????").as_slice())
        );
    }

    #[test]
    fn test_nested_bundle_files_listed() {
        let temp = tempdir().unwrap();
        let app = temp.path().join("Test.app");
        let framework = app.join("Frameworks/Kit.framework");
        fs::create_dir_all(framework.join("_CodeSignature")).unwrap();
        fs::write(framework.join("Kit"), b"kit").unwrap();
        fs::write(framework.join("_CodeSignature/CodeResources"), b"sealed").unwrap();

        let mut builder = CodeResourcesBuilder::new(&app);
        builder.scan().unwrap();
        let paths: Vec<_> = builder.files.keys().map(String::as_str).collect();
        assert!(paths.contains(&"Frameworks/Kit.framework/Kit"));
        assert!(paths.contains(&"Frameworks/Kit.framework/_CodeSignature/CodeResources"));
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_recorded_by_target() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().unwrap();
        let app = temp.path().join("Test.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("Real.txt"), b"real").unwrap();
        symlink("Real.txt", app.join("Link.txt")).unwrap();

        let mut builder = CodeResourcesBuilder::new(&app);
        builder.scan().unwrap();
        let root = manifest(&builder);

        let files = root.get("files").and_then(Value::as_dictionary).unwrap();
        assert!(!files.contains_key("Link.txt"));
        let files2 = root.get("files2").and_then(Value::as_dictionary).unwrap();
        let link = files2.get("Link.txt").and_then(Value::as_dictionary).unwrap();
        assert_eq!(link.get("symlink").and_then(Value::as_string), Some("Real.txt"));
    }

    #[test]
    fn test_rules2_omit_weights() {
        let rules2 = standard_rules2();
        let info = rules2
            .get("^Info\\.plist$")
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(info.get("omit").and_then(Value::as_boolean), Some(true));
        assert_eq!(info.get("weight").and_then(Value::as_real), Some(20.0));
        assert!(standard_rules().contains_key("^version.plist$"));
    }
}
