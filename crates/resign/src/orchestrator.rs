//! Deciding what an invocation does, and doing it.
//!
//! [`select_operation`] is the only place that tells an inspection request
//! from a signing request. It is a pure function of the target kind and the
//! request flags, so every row of the decision table is testable without a
//! filesystem.

use crate::backend::{AssetParams, Backend, FolderJob, MachOTarget, SignOutcome};
use crate::contract::ExitCode;
use crate::crypto::SigningAssets;
use crate::error::ErrorKind;
use crate::request::SignRequest;
use crate::timer::Stopwatch;
use crate::{Error, Result};
use log::{debug, info};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    MachO,
    Bundle,
}

impl TargetKind {
    /// Directories are bundles, anything else is a Mach-O image. The
    /// contents are not examined.
    pub fn classify(path: &Path) -> Self {
        if path.is_dir() {
            TargetKind::Bundle
        } else {
            TargetKind::MachO
        }
    }
}

/// The one thing an invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Log what the image contains. Always succeeds.
    Inspect,
    /// Check the existing signature without touching the image.
    Verify,
    SignMachO,
    SignBundle,
}

impl Operation {
    pub fn mutates(self) -> bool {
        matches!(self, Operation::SignMachO | Operation::SignBundle)
    }
}

/// Pick the operation for `request` against a target of `kind`.
///
/// Bundles always sign. A Mach-O is only inspected or verified when the
/// request is not ad-hoc, injects nothing and lacks credentials.
pub fn select_operation(kind: TargetKind, request: &SignRequest) -> Operation {
    match kind {
        TargetKind::Bundle => Operation::SignBundle,
        TargetKind::MachO => {
            let wants_signing = request.adhoc
                || !request.dylibs.is_empty()
                || request.has_signing_credentials();
            match (wants_signing, request.verify_only) {
                (true, _) => Operation::SignMachO,
                (false, true) => Operation::Verify,
                (false, false) => Operation::Inspect,
            }
        }
    }
}

/// Result of an invocation that ran to completion.
#[derive(Debug, Clone)]
pub struct Report {
    pub operation: Operation,
    /// `false` only when verification ran and rejected the signature.
    pub success: bool,
    pub outcome: Option<SignOutcome>,
    /// Time spent in the signing call, success or not.
    pub sign_elapsed: Option<Duration>,
    pub total_elapsed: Duration,
}

impl Report {
    /// [`ErrorKind::SignatureVerification`] when verification failed.
    pub fn kind(&self) -> Option<ErrorKind> {
        (!self.success).then_some(ErrorKind::SignatureVerification)
    }

    pub fn exit_code(&self) -> ExitCode {
        match self.kind() {
            Some(kind) => kind.exit_code(),
            None => ExitCode::Success,
        }
    }
}

/// Runs one validated request against a backend.
pub struct Orchestrator<'a, B: Backend + ?Sized> {
    backend: &'a B,
    request: &'a SignRequest,
}

impl<'a, B: Backend + ?Sized> Orchestrator<'a, B> {
    pub fn new(backend: &'a B, request: &'a SignRequest) -> Self {
        Self { backend, request }
    }

    /// Classify, dispatch and time the request.
    ///
    /// The total time is logged whether or not the operation succeeds.
    pub fn run(&self) -> Result<Report> {
        let total = Stopwatch::start();
        let kind = TargetKind::classify(&self.request.input);
        let operation = select_operation(kind, self.request);
        debug!("{kind:?} target, operation {operation:?}");

        let result = self.dispatch(operation);
        let total_elapsed = total.print_total();
        result.map(|(success, outcome, sign_elapsed)| Report {
            operation,
            success,
            outcome,
            sign_elapsed,
            total_elapsed,
        })
    }

    fn dispatch(
        &self,
        operation: Operation,
    ) -> Result<(bool, Option<SignOutcome>, Option<Duration>)> {
        let path = self.request.input.as_path();
        match operation {
            Operation::Inspect => {
                self.backend.open_macho(path)?.print_info();
                Ok((true, None, None))
            }
            Operation::Verify => {
                let ok = self.backend.open_macho(path)?.check_signature();
                Ok((ok, None, None))
            }
            Operation::SignMachO => {
                let mut image = self.backend.open_macho(path)?;
                let assets = self.load_assets(true)?;
                self.inject(image.as_mut())?;
                let (outcome, elapsed) = self.timed(|| {
                    image.sign(&assets, self.request.force, self.request.bundle_id.as_deref())
                });
                Ok((true, Some(outcome.map_err(Error::signing)?), Some(elapsed)))
            }
            Operation::SignBundle => {
                let assets = self.load_assets(false)?;
                let job = FolderJob {
                    path,
                    bundle_id: self.request.bundle_id.as_deref(),
                    bundle_version: self.request.bundle_version.as_deref(),
                    bundle_name: self.request.bundle_name.as_deref(),
                    dylibs: &self.request.dylibs,
                    force: self.request.force,
                    weak_inject: self.request.weak_inject,
                    top_level: true,
                };
                let (outcome, elapsed) = self.timed(|| self.backend.sign_folder(&assets, &job));
                let outcome = outcome.map_err(|e| match e {
                    Error::Injection { .. } => e,
                    e => Error::signing(e),
                })?;
                Ok((true, Some(outcome), Some(elapsed)))
            }
        }
    }

    fn load_assets(&self, single_file: bool) -> Result<SigningAssets> {
        let request = self.request;
        let params = AssetParams {
            certificate: request.certificate.clone(),
            private_key: request.private_key.clone(),
            provisioning_profile: request.provisioning_profile.clone(),
            password: request.password.clone(),
            entitlements: request.entitlements.clone(),
            adhoc: request.adhoc,
            sha256_only: request.sha256_only,
            single_file,
        };
        self.backend.load_assets(&params).map_err(Error::assets)
    }

    /// Inject in list order. The first failure stops the invocation before
    /// anything is signed.
    fn inject(&self, image: &mut dyn MachOTarget) -> Result<()> {
        for dylib in &self.request.dylibs {
            image
                .inject_dylib(self.request.weak_inject, dylib)
                .map_err(|e| Error::injection(dylib, e))?;
        }
        Ok(())
    }

    fn timed<T>(&self, sign: impl FnOnce() -> Result<T>) -> (Result<T>, Duration) {
        info!(">>> Signing: {}", self.request.input.display());
        let watch = Stopwatch::start();
        let result = sign();
        let elapsed = watch.finish(result.is_ok());
        (result, elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(is_dir: bool, request: SignRequest) -> Operation {
        let kind = if is_dir {
            TargetKind::Bundle
        } else {
            TargetKind::MachO
        };
        select_operation(kind, &request)
    }

    fn creds(request: SignRequest) -> SignRequest {
        request
            .certificate("c.pem")
            .private_key("k.pem")
            .provisioning_profile("p.mobileprovision")
    }

    #[test]
    fn test_bundle_always_signs() {
        let bare = SignRequest::new("App.app");
        assert_eq!(decide(true, bare.clone()), Operation::SignBundle);
        assert_eq!(decide(true, bare.verify_only(true)), Operation::SignBundle);
    }

    #[test]
    fn test_macho_without_credentials() {
        let bare = SignRequest::new("bin");
        assert_eq!(decide(false, bare.clone()), Operation::Inspect);
        assert_eq!(decide(false, bare.verify_only(true)), Operation::Verify);
    }

    #[test]
    fn test_macho_signing_triggers() {
        let bare = SignRequest::new("bin").verify_only(true);
        assert_eq!(decide(false, bare.clone().adhoc(true)), Operation::SignMachO);
        assert_eq!(decide(false, bare.clone().dylib("x.dylib")), Operation::SignMachO);
        assert_eq!(decide(false, creds(bare.clone())), Operation::SignMachO);
        // A key and certificate without a profile are not enough.
        assert_eq!(
            decide(false, bare.certificate("c.pem").private_key("k.pem")),
            Operation::Verify
        );
    }

    #[test]
    fn test_classify_by_filesystem() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("bin");
        std::fs::write(&file, b"not even mach-o").unwrap();
        assert_eq!(TargetKind::classify(temp.path()), TargetKind::Bundle);
        assert_eq!(TargetKind::classify(&file), TargetKind::MachO);
    }

    #[test]
    fn test_report_codes() {
        let report = Report {
            operation: Operation::Verify,
            success: false,
            outcome: None,
            sign_elapsed: None,
            total_elapsed: Duration::ZERO,
        };
        assert_eq!(report.kind(), Some(ErrorKind::SignatureVerification));
        assert_eq!(report.exit_code(), ExitCode::VerificationFailed);
        assert!(!report.operation.mutates());
    }
}
