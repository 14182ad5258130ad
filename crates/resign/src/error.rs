//! Error types for re-signing operations.
//!
//! [`enum@Error`] covers every failure the orchestrator and the native
//! collaborators can raise. Collaborator failures are wrapped by the
//! orchestrator into a stage variant (`Assets`, `Injection`, `Signing`, ...)
//! so callers can recover the failure class through [`Error::kind`] without
//! parsing messages.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error
//! - [`crate::ExitCode`] - The stable integer taxonomy errors collapse onto

use crate::contract::ExitCode;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for re-signing operations.
///
/// # Examples
///
/// ```no_run
/// use resign::{try_sign_target, ErrorKind, SignRequest};
///
/// let request = SignRequest::new("Payload/App.app").adhoc(true);
/// match try_sign_target(&request) {
///     Ok(report) => println!("done in {:?}", report.total_elapsed),
///     Err(e) if e.kind() == ErrorKind::AssetInitialization => eprintln!("bad credentials: {e}"),
///     Err(e) => eprintln!("failed: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// The input path is empty or does not resolve to a filesystem entry.
    #[error("Invalid input path: {0}")]
    InvalidInput(String),

    /// The resolved temp folder is not a directory.
    #[error("Invalid temp folder: {}", .0.display())]
    InvalidTempFolder(PathBuf),

    /// The Mach-O collaborator could not open the input file.
    #[error("Invalid Mach-O file {}: {source}", .path.display())]
    InvalidImage {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// Certificate, key, profile, password or entitlements could not be loaded.
    #[error("Failed to load signing assets: {0}")]
    Assets(#[source] Box<Error>),

    /// A dylib could not be injected; nothing was signed.
    #[error("Failed to inject {dylib}: {source}")]
    Injection {
        dylib: String,
        #[source]
        source: Box<Error>,
    },

    /// The collaborator's sign operation failed.
    #[error("Signing failed: {0}")]
    Signing(#[source] Box<Error>),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Property list parsing or serialization failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// Malformed or unsupported Mach-O content.
    #[error("Invalid Mach-O: {0}")]
    MachO(String),

    /// Invalid or mismatched certificate or private key.
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    /// Incorrect password for a PKCS#12 container or encrypted key.
    #[error("Invalid password for private key or PKCS#12")]
    InvalidPassword,

    /// Invalid or missing provisioning profile.
    #[error("Invalid provisioning profile: {0}")]
    ProvisioningProfile(String),

    /// Entitlements file is unreadable or not a plist dictionary.
    #[error("Invalid entitlements: {0}")]
    Entitlements(String),

    /// CMS signature generation or parsing failed.
    #[error("CMS error: {0}")]
    Cms(String),

    /// The directory is not a signable bundle.
    #[error("Invalid bundle: {0}")]
    Bundle(String),
}

/// Failure classes exposed to callers that want more than an exit code.
///
/// Every class except [`ErrorKind::SignatureVerification`] collapses to
/// [`ExitCode::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    InvalidTempFolder,
    AssetInitialization,
    Injection,
    /// Verification ran and the existing signature is invalid. Reported as a
    /// result, never raised as an [`enum@Error`].
    SignatureVerification,
    Signing,
}

impl ErrorKind {
    /// Map to the stable exit-code taxonomy.
    pub fn exit_code(self) -> ExitCode {
        match self {
            ErrorKind::SignatureVerification => ExitCode::VerificationFailed,
            _ => ExitCode::Failure,
        }
    }
}

impl Error {
    pub(crate) fn assets(source: Error) -> Self {
        Error::Assets(Box::new(source))
    }

    pub(crate) fn signing(source: Error) -> Self {
        Error::Signing(Box::new(source))
    }

    pub(crate) fn injection(dylib: impl Into<String>, source: Error) -> Self {
        Error::Injection {
            dylib: dylib.into(),
            source: Box::new(source),
        }
    }

    /// Classify this error.
    ///
    /// Unwrapped low-level errors only escape from collaborators called
    /// outside the orchestrator, where the signing stage is the only
    /// candidate.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::InvalidImage { .. } => ErrorKind::InvalidInput,
            Error::InvalidTempFolder(_) => ErrorKind::InvalidTempFolder,
            Error::Assets(_)
            | Error::Certificate(_)
            | Error::InvalidPassword
            | Error::ProvisioningProfile(_)
            | Error::Entitlements(_) => ErrorKind::AssetInitialization,
            Error::Injection { .. } => ErrorKind::Injection,
            _ => ErrorKind::Signing,
        }
    }

    /// Exit code this error collapses to.
    pub fn exit_code(&self) -> ExitCode {
        self.kind().exit_code()
    }
}
