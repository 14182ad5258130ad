//! Re-sign iOS Mach-O images and application bundles.
//!
//! A [`SignRequest`] names the target and the credentials. [`sign_target`]
//! decides whether the target is inspected, verified or signed, loads the
//! signing material once, injects any requested dylibs and signs.
//!
//! ```no_run
//! use resign::{sign_target, ExitCode, SignRequest};
//!
//! let request = SignRequest::new("build/Tool").adhoc(true).force(true);
//! assert_eq!(sign_target(&request), ExitCode::Success);
//! ```

pub mod backend;
pub mod bundle;
pub mod codesign;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod macho;
pub mod orchestrator;
pub mod request;
pub mod timer;
pub mod workspace;

pub use backend::{AssetParams, Backend, FolderJob, MachOTarget, NativeBackend, SignOutcome};
pub use bundle::CodeResourcesBuilder;
pub use contract::{
    check, sign_target, sign_target_with, try_sign_target, try_sign_target_with, version,
    ExitCode, SignError,
};
pub use crypto::{DigestPolicy, SigningAssets, SigningMode};
pub use error::{Error, ErrorKind};
pub use macho::MachOImage;
pub use orchestrator::{select_operation, Operation, Orchestrator, Report, TargetKind};
pub use request::SignRequest;

pub type Result<T> = std::result::Result<T, Error>;
