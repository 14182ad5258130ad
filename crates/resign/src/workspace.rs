//! Request-scoped scratch space.
//!
//! Every invocation gets its own directory under the resolved temp folder.
//! It is removed when the [`Workspace`] drops, on success and failure
//! alike, unless debug mode asked to keep it. Debug mode also routes
//! intermediate artifacts to a dump directory.

use crate::{Error, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Name of the debug-artifact directory created in the working directory.
pub const DEBUG_DIR_NAME: &str = ".resign_debug";

#[derive(Debug)]
enum Scratch {
    Owned(TempDir),
    Kept(PathBuf),
}

/// Owner of the per-invocation scratch directory.
#[derive(Debug)]
pub struct Workspace {
    scratch: Scratch,
    staging: Staging,
}

impl Workspace {
    /// Create a scratch directory inside `temp_folder`.
    ///
    /// With `debug_dir` set, the scratch directory survives the invocation
    /// and artifacts are dumped into `debug_dir`.
    pub fn create(temp_folder: &Path, debug_dir: Option<PathBuf>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("resign-")
            .tempdir_in(temp_folder)
            .map_err(|e| {
                debug!("cannot create scratch dir in {}: {e}", temp_folder.display());
                Error::InvalidTempFolder(temp_folder.to_path_buf())
            })?;

        let scratch = if debug_dir.is_some() {
            let kept = dir.keep();
            debug!("keeping scratch dir {}", kept.display());
            Scratch::Kept(kept)
        } else {
            Scratch::Owned(dir)
        };

        let staging = Staging {
            dir: match &scratch {
                Scratch::Owned(dir) => dir.path().to_path_buf(),
                Scratch::Kept(path) => path.clone(),
            },
            debug_dir,
        };
        Ok(Self { scratch, staging })
    }

    pub fn path(&self) -> &Path {
        match &self.scratch {
            Scratch::Owned(dir) => dir.path(),
            Scratch::Kept(path) => path,
        }
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }
}

/// Where collaborators stage files and dump debug artifacts.
///
/// Cheap to clone. It does not own the directory.
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
    debug_dir: Option<PathBuf>,
}

impl Staging {
    /// Staging rooted at an existing directory, without debug dumps.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            debug_dir: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn debug_dir(&self) -> Option<&Path> {
        self.debug_dir.as_deref()
    }

    /// Write `bytes` to the debug directory as `name`. No-op outside debug
    /// mode. Failures are logged, never raised.
    pub fn dump(&self, name: &str, bytes: &[u8]) {
        let Some(dir) = &self.debug_dir else {
            return;
        };
        let path = dir.join(name);
        match fs::write(&path, bytes) {
            Ok(()) => debug!("dumped {}", path.display()),
            Err(e) => warn!("cannot dump {}: {e}", path.display()),
        }
    }
}
