//! The per-invocation request.

use crate::crypto::assets::is_pkcs12;
use secrecy::SecretString;
use std::path::{Path, PathBuf};

/// Everything one invocation needs, built once and never mutated.
///
/// # Example
///
/// ```no_run
/// use resign::{sign_target, ExitCode, SignRequest};
///
/// let request = SignRequest::new("Payload/App.app")
///     .private_key("identity.p12")
///     .password("secret")
///     .provisioning_profile("profile.mobileprovision")
///     .bundle_id("com.example.resigned")
///     .dylib("libhook.dylib");
/// assert_eq!(sign_target(&request), ExitCode::Success);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SignRequest {
    pub(crate) input: PathBuf,
    pub(crate) certificate: Option<PathBuf>,
    pub(crate) private_key: Option<PathBuf>,
    pub(crate) provisioning_profile: Option<PathBuf>,
    pub(crate) password: Option<SecretString>,
    pub(crate) adhoc: bool,
    pub(crate) sha256_only: bool,
    pub(crate) bundle_id: Option<String>,
    pub(crate) bundle_name: Option<String>,
    pub(crate) bundle_version: Option<String>,
    pub(crate) entitlements: Option<PathBuf>,
    pub(crate) dylibs: Vec<String>,
    pub(crate) weak_inject: bool,
    pub(crate) force: bool,
    pub(crate) verify_only: bool,
    pub(crate) temp_folder: Option<PathBuf>,
    pub(crate) debug: bool,
    pub(crate) quiet: bool,
}

/// `None` for empty strings, the way an unset CLI argument arrives.
fn non_empty_path(path: impl AsRef<Path>) -> Option<PathBuf> {
    let path = path.as_ref();
    (!path.as_os_str().is_empty()).then(|| path.to_path_buf())
}

fn non_empty(value: impl Into<String>) -> Option<String> {
    let value = value.into();
    (!value.is_empty()).then_some(value)
}

impl SignRequest {
    pub fn new(input: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Certificate file (PEM or DER). Optional with a PKCS#12 key.
    pub fn certificate(mut self, path: impl AsRef<Path>) -> Self {
        self.certificate = non_empty_path(path);
        self
    }

    /// Private key file: PKCS#8 PEM/DER, or a `.p12`/`.pfx` container.
    pub fn private_key(mut self, path: impl AsRef<Path>) -> Self {
        self.private_key = non_empty_path(path);
        self
    }

    pub fn provisioning_profile(mut self, path: impl AsRef<Path>) -> Self {
        self.provisioning_profile = non_empty_path(path);
        self
    }

    /// Password for an encrypted key or PKCS#12 container.
    ///
    /// Zeroized on drop and redacted from `Debug` output.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = non_empty(password).map(SecretString::new);
        self
    }

    pub fn adhoc(mut self, adhoc: bool) -> Self {
        self.adhoc = adhoc;
        self
    }

    /// Emit only the SHA-256 CodeDirectory.
    pub fn sha256_only(mut self, sha256_only: bool) -> Self {
        self.sha256_only = sha256_only;
        self
    }

    pub fn bundle_id(mut self, id: impl Into<String>) -> Self {
        self.bundle_id = non_empty(id);
        self
    }

    pub fn bundle_name(mut self, name: impl Into<String>) -> Self {
        self.bundle_name = non_empty(name);
        self
    }

    pub fn bundle_version(mut self, version: impl Into<String>) -> Self {
        self.bundle_version = non_empty(version);
        self
    }

    /// Entitlements plist replacing the provisioning profile's.
    pub fn entitlements(mut self, path: impl AsRef<Path>) -> Self {
        self.entitlements = non_empty_path(path);
        self
    }

    /// Append a dylib to inject. Dylibs are injected in call order.
    pub fn dylib(mut self, path: impl Into<String>) -> Self {
        if let Some(path) = non_empty(path) {
            self.dylibs.push(path);
        }
        self
    }

    pub fn dylibs<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dylibs.extend(paths.into_iter().filter_map(non_empty));
        self
    }

    pub fn weak_inject(mut self, weak: bool) -> Self {
        self.weak_inject = weak;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Verify instead of inspect when no signing is requested.
    pub fn verify_only(mut self, verify: bool) -> Self {
        self.verify_only = verify;
        self
    }

    /// Scratch folder. Defaults to the platform temp directory.
    pub fn temp_folder(mut self, path: impl AsRef<Path>) -> Self {
        self.temp_folder = non_empty_path(path);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn dylib_list(&self) -> &[String] {
        &self.dylibs
    }

    /// Whether enough credential material was supplied to sign with an
    /// identity: a key, a profile, and a certificate unless the key is a
    /// PKCS#12 container carrying its own.
    pub fn has_signing_credentials(&self) -> bool {
        let Some(key) = &self.private_key else {
            return false;
        };
        if self.provisioning_profile.is_none() {
            return false;
        }
        self.certificate.is_some() || is_pkcs12(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_empty_strings_are_unset() {
        let request = SignRequest::new("App.app")
            .certificate("")
            .private_key("")
            .password("")
            .bundle_id("")
            .dylib("")
            .temp_folder("");
        assert!(request.certificate.is_none());
        assert!(request.private_key.is_none());
        assert!(request.password.is_none());
        assert!(request.bundle_id.is_none());
        assert!(request.dylibs.is_empty());
        assert!(request.temp_folder.is_none());
    }

    #[test]
    fn test_dylib_order_preserved() {
        let request = SignRequest::new("a")
            .dylib("one.dylib")
            .dylibs(["two.dylib", "", "three.dylib"]);
        assert_eq!(
            request.dylib_list(),
            &["one.dylib", "two.dylib", "three.dylib"]
        );
    }

    #[test]
    fn test_credentials_rule() {
        let base = SignRequest::new("bin");
        assert!(!base.has_signing_credentials());

        let pem = base
            .clone()
            .certificate("cert.pem")
            .private_key("key.pem")
            .provisioning_profile("p.mobileprovision");
        assert!(pem.has_signing_credentials());
        assert!(!pem.clone().certificate("").has_signing_credentials());
        assert!(!pem.clone().provisioning_profile("").has_signing_credentials());

        let p12 = base
            .private_key("identity.P12")
            .provisioning_profile("p.mobileprovision");
        assert!(p12.has_signing_credentials());
    }

    #[test]
    fn test_password_redacted() {
        let request = SignRequest::new("bin").password("hunter2");
        assert!(!format!("{request:?}").contains("hunter2"));
        assert_eq!(
            request.password.as_ref().map(|p| p.expose_secret().as_str()),
            Some("hunter2")
        );
    }
}
