//! CMS signatures over CodeDirectories.
//!
//! The signature embedded in slot `0x10000` is a detached CMS SignedData
//! whose content is the primary CodeDirectory. Two signed attributes carry
//! the CDHashes of every CodeDirectory so the kernel can pick the strongest
//! one:
//!
//! - `1.2.840.113635.100.9.1`: an XML plist `{ cdhashes: [<data>...] }`
//!   with each hash truncated to 20 bytes.
//! - `1.2.840.113635.100.9.2`: one `SEQUENCE { digestAlgorithm, OCTET STRING }`
//!   per CodeDirectory with the full hash.

use crate::codesign::HashKind;
use crate::{Error, Result};
use bcder::encode::PrimitiveContent;
use bcder::{Captured, Mode, OctetString, Oid};
use bytes::Bytes;
use cryptographic_message_syntax::{SignedData, SignedDataBuilder, SignerBuilder};
use plist::Value;
use x509_certificate::{rfc5652::AttributeValue, CapturedX509Certificate, KeyInfoSigner};

const OID_APPLE_CDHASHES: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];
const OID_APPLE_CDHASHES2: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x02];
const OID_SHA1: &[u8] = &[0x2b, 0x0e, 0x03, 0x02, 0x1a];
const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// Truncated length used in the cdhashes plist.
const CDHASH_TRUNCATED_LEN: usize = 20;

/// A CodeDirectory hash, tagged with the directory's digest kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdHash {
    pub kind: HashKind,
    pub digest: Vec<u8>,
}

/// Sign `code_directory` with Apple's CDHash attributes.
///
/// `cdhashes` lists every CodeDirectory in slot order.
pub fn sign_code_directory(
    code_directory: &[u8],
    cdhashes: &[CdHash],
    key: &dyn KeyInfoSigner,
    certificate: &CapturedX509Certificate,
    chain: &[CapturedX509Certificate],
) -> Result<Vec<u8>> {
    let plist = cdhashes_plist(cdhashes)?;
    let plist_value = AttributeValue::new(Captured::from_values(
        Mode::Der,
        OctetString::encode_slice(plist.as_slice()),
    ));

    let digest_values = cdhashes
        .iter()
        .map(|cdhash| {
            let algorithm = Oid(Bytes::from_static(digest_oid(cdhash.kind)));
            AttributeValue::new(Captured::from_values(
                Mode::Der,
                bcder::encode::sequence((
                    algorithm.encode_ref(),
                    OctetString::encode_slice(cdhash.digest.as_slice()),
                )),
            ))
        })
        .collect::<Vec<_>>();

    let signer = SignerBuilder::new(key, certificate.clone())
        .signed_attribute(
            Oid(Bytes::from_static(OID_APPLE_CDHASHES)),
            vec![plist_value],
        )
        .signed_attribute(Oid(Bytes::from_static(OID_APPLE_CDHASHES2)), digest_values);

    let mut builder = SignedDataBuilder::default()
        .content_external(code_directory.to_vec())
        .signer(signer)
        .certificate(certificate.clone());
    for cert in chain {
        builder = builder.certificate(cert.clone());
    }

    builder
        .build_der()
        .map_err(|e| Error::Cms(format!("failed to build signature: {e}")))
}

fn digest_oid(kind: HashKind) -> &'static [u8] {
    match kind {
        HashKind::Sha1 => OID_SHA1,
        HashKind::Sha256 => OID_SHA256,
    }
}

/// The cdhashes plist, terminated by a newline as `codesign` writes it.
pub fn cdhashes_plist(cdhashes: &[CdHash]) -> Result<Vec<u8>> {
    let hashes = cdhashes
        .iter()
        .map(|cdhash| {
            let len = cdhash.digest.len().min(CDHASH_TRUNCATED_LEN);
            Value::Data(cdhash.digest[..len].to_vec())
        })
        .collect();

    let mut dict = plist::Dictionary::new();
    dict.insert("cdhashes".into(), Value::Array(hashes));

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Result of checking a detached CMS signature.
#[derive(Debug, Clone, Default)]
pub struct CmsSummary {
    pub signer_names: Vec<String>,
}

/// Verify a detached signature over `content`.
///
/// Every signer must have a valid signature and a message digest that
/// matches `content`.
pub fn verify_detached(cms: &[u8], content: &[u8]) -> Result<CmsSummary> {
    let signed = SignedData::parse_ber(cms).map_err(|e| Error::Cms(format!("malformed: {e}")))?;

    let mut summary = CmsSummary::default();
    let mut signers = 0;
    for signer in signed.signers() {
        signers += 1;
        signer
            .verify_signature_with_signed_data(&signed)
            .map_err(|e| Error::Cms(format!("signature invalid: {e}")))?;
        signer
            .verify_message_digest_with_content(content)
            .map_err(|e| Error::Cms(format!("message digest mismatch: {e}")))?;
    }
    if signers == 0 {
        return Err(Error::Cms("no signers".into()));
    }

    summary.signer_names = signed
        .certificates()
        .filter_map(|cert| cert.subject_common_name())
        .collect();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_certificate::{EcdsaCurve, KeyAlgorithm, X509CertificateBuilder};

    fn cdhashes(cd: &[u8]) -> Vec<CdHash> {
        vec![
            CdHash {
                kind: HashKind::Sha1,
                digest: HashKind::Sha1.digest(cd),
            },
            CdHash {
                kind: HashKind::Sha256,
                digest: HashKind::Sha256.digest(cd),
            },
        ]
    }

    #[test]
    fn test_cdhashes_plist_truncates() {
        let plist = cdhashes_plist(&cdhashes(b"directory")).unwrap();
        assert_eq!(plist.last(), Some(&b'\n'));

        let value: Value = plist::from_bytes(&plist).unwrap();
        let hashes = value
            .as_dictionary()
            .and_then(|d| d.get("cdhashes"))
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(hashes.len(), 2);
        for hash in hashes {
            assert_eq!(hash.as_data().unwrap().len(), CDHASH_TRUNCATED_LEN);
        }
    }

    #[test]
    fn test_sign_then_verify() {
        let mut builder = X509CertificateBuilder::default();
        builder
            .subject()
            .append_common_name_utf8_string("Apple Development: Test")
            .unwrap();
        let (cert, key) = builder
            .create_with_random_keypair(KeyAlgorithm::Ecdsa(EcdsaCurve::Secp256r1))
            .unwrap();

        let cd = b"pretend this is a CodeDirectory".to_vec();
        let cms = sign_code_directory(&cd, &cdhashes(&cd), &key, &cert, &[]).unwrap();

        let summary = verify_detached(&cms, &cd).unwrap();
        assert_eq!(summary.signer_names, vec!["Apple Development: Test".to_string()]);

        assert!(verify_detached(&cms, b"other content").is_err());
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(matches!(verify_detached(b"nope", b""), Err(Error::Cms(_))));
    }
}
