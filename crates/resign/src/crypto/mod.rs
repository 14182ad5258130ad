//! Certificates, keys, provisioning profiles and CMS.

pub mod assets;
pub mod cms;
pub mod profile;

pub use assets::{DigestPolicy, SigningAssets, SigningIdentity, SigningMode};
pub use profile::ProvisioningProfile;
