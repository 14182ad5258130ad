//! Provisioning profile parsing.
//!
//! A `.mobileprovision` file is a CMS SignedData message whose encapsulated
//! content is an XML plist. The CMS layer is parsed properly when possible.
//! Profiles with a damaged envelope fall back to locating the embedded
//! plist by its XML markers.

use crate::{Error, Result};
use cryptographic_message_syntax::SignedData;
use log::debug;
use plist::{Dictionary, Value};
use std::fs;
use std::path::Path;

/// Fields of a provisioning profile used while signing.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    raw: Vec<u8>,
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub team_ids: Vec<String>,
    pub entitlements: Dictionary,
}

impl ProvisioningProfile {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|e| {
            Error::ProvisioningProfile(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(raw)
    }

    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let content = embedded_plist(&raw)?;
        let value: Value = plist::from_bytes(&content)
            .map_err(|e| Error::ProvisioningProfile(format!("malformed plist: {e}")))?;
        let mut dict = value
            .into_dictionary()
            .ok_or_else(|| Error::ProvisioningProfile("plist root is not a dictionary".into()))?;

        let entitlements = dict
            .remove("Entitlements")
            .and_then(Value::into_dictionary)
            .ok_or_else(|| Error::ProvisioningProfile("no Entitlements dictionary".into()))?;

        let team_ids = dict
            .get("TeamIdentifier")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_string)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            raw,
            name: string_field(&dict, "Name"),
            uuid: string_field(&dict, "UUID"),
            team_ids,
            entitlements,
        })
    }

    /// Original bytes, embedded verbatim as `embedded.mobileprovision`.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn team_id(&self) -> Option<&str> {
        self.team_ids.first().map(String::as_str)
    }

    pub fn application_identifier(&self) -> Option<&str> {
        self.entitlements
            .get("application-identifier")
            .and_then(Value::as_string)
    }

    /// Entitlements serialized as an XML plist.
    pub fn entitlements_xml(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(self.entitlements.clone()))?;
        Ok(buf)
    }
}

fn string_field(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_owned)
}

fn embedded_plist(raw: &[u8]) -> Result<Vec<u8>> {
    match SignedData::parse_ber(raw) {
        Ok(signed) => {
            if let Some(content) = signed.signed_content() {
                return Ok(content.to_vec());
            }
            debug!("provisioning profile CMS has no encapsulated content");
        }
        Err(e) => debug!("provisioning profile is not valid CMS ({e}), scanning for plist"),
    }

    let start = find(raw, b"<?xml")
        .ok_or_else(|| Error::ProvisioningProfile("no embedded plist".into()))?;
    let end = find(&raw[start..], b"</plist>")
        .map(|p| start + p + b"</plist>".len())
        .ok_or_else(|| Error::ProvisioningProfile("unterminated embedded plist".into()))?;
    Ok(raw[start..end].to_vec())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
