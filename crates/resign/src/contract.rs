//! Stable entry points.
//!
//! [`sign_target`] is the integer-returning contract shared by the CLI and
//! any embedding host. [`try_sign_target`] returns the same outcome as a
//! typed [`Report`] or [`Error`] for Rust callers.

use crate::backend::{Backend, NativeBackend};
use crate::logging::{self, Verbosity};
use crate::orchestrator::{Orchestrator, Report};
use crate::request::SignRequest;
use crate::workspace::{Workspace, DEBUG_DIR_NAME};
use crate::{Error, Result};
use log::{debug, error, warn};
use std::env;
use std::error::Error as _;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Integer result of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    /// Bad input, asset load, injection or signing failure.
    Failure = -1,
    /// Verification ran and the signature is invalid.
    VerificationFailed = -2,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            -1 => Some(ExitCode::Failure),
            -2 => Some(ExitCode::VerificationFailed),
            _ => None,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.code()
    }
}

/// Failure decoded from a raw exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignError {
    #[error("signing failed")]
    SigningFailed,
    #[error("target is not validly signed")]
    NotSigned,
    #[error("unknown exit code {0}")]
    Unknown(i32),
}

/// Decode a raw exit code.
pub fn check(code: i32) -> std::result::Result<(), SignError> {
    match ExitCode::from_raw(code) {
        Some(ExitCode::Success) => Ok(()),
        Some(ExitCode::Failure) => Err(SignError::SigningFailed),
        Some(ExitCode::VerificationFailed) => Err(SignError::NotSigned),
        None => Err(SignError::Unknown(code)),
    }
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Run `request` with the native collaborators.
pub fn sign_target(request: &SignRequest) -> ExitCode {
    exit_code(try_sign_target(request))
}

/// Run `request` against a caller-supplied backend.
pub fn sign_target_with<B: Backend + ?Sized>(request: &SignRequest, backend: &B) -> ExitCode {
    exit_code(try_sign_target_with(request, backend))
}

pub fn try_sign_target(request: &SignRequest) -> Result<Report> {
    let prepared = prepare(request)?;
    let workspace = Workspace::create(&prepared.temp_folder, prepared.debug_dir)?;
    let backend = NativeBackend::new(workspace.staging().clone());
    Orchestrator::new(&backend, request).run()
}

pub fn try_sign_target_with<B: Backend + ?Sized>(
    request: &SignRequest,
    backend: &B,
) -> Result<Report> {
    prepare(request)?;
    Orchestrator::new(backend, request).run()
}

struct Prepared {
    temp_folder: PathBuf,
    debug_dir: Option<PathBuf>,
}

/// Apply verbosity, validate paths and set up the debug directory.
fn prepare(request: &SignRequest) -> Result<Prepared> {
    logging::apply(Verbosity::from_flags(request.debug, request.quiet));

    let input = &request.input;
    if input.as_os_str().is_empty() {
        return Err(Error::InvalidInput("no input path".into()));
    }
    if fs::symlink_metadata(input).is_err() {
        return Err(Error::InvalidInput(format!(
            "{} does not exist",
            input.display()
        )));
    }

    let temp_folder = request.temp_folder.clone().unwrap_or_else(env::temp_dir);
    if !temp_folder.is_dir() {
        return Err(Error::InvalidTempFolder(temp_folder));
    }

    let debug_dir = if request.debug {
        let dir = PathBuf::from(DEBUG_DIR_NAME);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                debug!("debug artifacts go to {}", dir.display());
                Some(dir)
            }
            Err(e) => {
                warn!("cannot create {}: {e}", dir.display());
                None
            }
        }
    } else {
        None
    };

    Ok(Prepared {
        temp_folder,
        debug_dir,
    })
}

fn exit_code(result: Result<Report>) -> ExitCode {
    match result {
        Ok(report) => report.exit_code(),
        Err(e) => {
            error!("{e}");
            let mut source = e.source();
            while let Some(cause) = source {
                debug!("  caused by: {cause}");
                source = cause.source();
            }
            e.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_raw_codes() {
        assert_eq!(ExitCode::Failure.code(), -1);
        assert_eq!(i32::from(ExitCode::VerificationFailed), -2);
        assert_eq!(check(0), Ok(()));
        assert_eq!(check(-1), Err(SignError::SigningFailed));
        assert_eq!(check(-2), Err(SignError::NotSigned));
        assert_eq!(check(7), Err(SignError::Unknown(7)));
    }

    #[test]
    fn test_empty_and_missing_input() {
        let err = try_sign_target(&SignRequest::new("")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let temp = tempfile::tempdir().unwrap();
        let missing = SignRequest::new(temp.path().join("missing"));
        assert_eq!(sign_target(&missing), ExitCode::Failure);
    }

    #[test]
    fn test_temp_folder_must_be_directory() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, b"x").unwrap();
        let request = SignRequest::new(&file).temp_folder(&file);
        let err = try_sign_target(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTempFolder);
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
