//! SuperBlob assembly and parsing.
//!
//! An embedded signature is a SuperBlob: a 12-byte header (magic, total
//! length, entry count), an index of `(slot, offset)` pairs, then the blobs
//! themselves. Every inner blob starts with its own `(magic, length)` header.
//! All integers are big-endian.
//!
//! ```text
//! magic | length | count | slot0 off0 | slot1 off1 | ... | blob0 | blob1 | ...
//! ```

use super::constants::*;
use crate::{Error, Result};

const SUPERBLOB_HEADER_SIZE: usize = 12;
const INDEX_ENTRY_SIZE: usize = 8;
const BLOB_HEADER_SIZE: usize = 8;

/// Wrap a payload with a `(magic, length)` blob header.
pub fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let total = (BLOB_HEADER_SIZE + payload.len()) as u32;
    let mut buf = Vec::with_capacity(total as usize);
    buf.extend(magic.to_be_bytes());
    buf.extend(total.to_be_bytes());
    buf.extend(payload);
    buf
}

/// XML entitlements blob (slot 5).
pub fn entitlements_blob(plist_xml: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, plist_xml)
}

/// DER entitlements blob (slot 7).
pub fn der_entitlements_blob(der: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, der)
}

/// Requirements set with no requirements.
pub fn empty_requirements_blob() -> Vec<u8> {
    wrap_blob(CSMAGIC_REQUIREMENTS, &0u32.to_be_bytes())
}

/// CMS wrapper blob. Ad-hoc signatures carry an empty wrapper.
pub fn signature_blob(cms_der: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_BLOBWRAPPER, cms_der)
}

/// Payload of a blob, after its 8-byte header.
///
/// The declared length is trusted only when it fits the slice.
pub fn blob_payload(blob: &[u8]) -> &[u8] {
    if blob.len() < BLOB_HEADER_SIZE {
        return &[];
    }
    let declared = read_be32(blob, 4) as usize;
    let end = declared.clamp(BLOB_HEADER_SIZE, blob.len());
    &blob[BLOB_HEADER_SIZE..end]
}

/// Builds a SuperBlob from slot-tagged blobs.
///
/// Entries are emitted in ascending slot order regardless of insertion
/// order, matching what `codesign` produces.
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    entries: Vec<(u32, Vec<u8>)>,
}

impl SuperBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob for `slot`, replacing any previous one.
    pub fn blob(mut self, slot: u32, data: Vec<u8>) -> Self {
        self.entries.retain(|(s, _)| *s != slot);
        self.entries.push((slot, data));
        self
    }

    /// Size of the serialized SuperBlob.
    pub fn len(&self) -> usize {
        SUPERBLOB_HEADER_SIZE
            + self.entries.len() * INDEX_ENTRY_SIZE
            + self.entries.iter().map(|(_, d)| d.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(mut self) -> Vec<u8> {
        self.entries.sort_by_key(|(slot, _)| *slot);

        let total = self.len();
        let mut buf = Vec::with_capacity(total);
        buf.extend(CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        buf.extend((total as u32).to_be_bytes());
        buf.extend((self.entries.len() as u32).to_be_bytes());

        let mut offset = SUPERBLOB_HEADER_SIZE + self.entries.len() * INDEX_ENTRY_SIZE;
        for (slot, data) in &self.entries {
            buf.extend(slot.to_be_bytes());
            buf.extend((offset as u32).to_be_bytes());
            offset += data.len();
        }
        for (_, data) in self.entries {
            buf.extend(data);
        }
        buf
    }
}

/// A parsed, borrowed view of an embedded signature.
#[derive(Debug)]
pub struct SuperBlob<'a> {
    entries: Vec<(u32, &'a [u8])>,
}

impl<'a> SuperBlob<'a> {
    /// Parse a SuperBlob. Trailing zero padding after the declared length is
    /// ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < SUPERBLOB_HEADER_SIZE {
            return Err(Error::MachO("code signature too small".into()));
        }
        let magic = read_be32(data, 0);
        if magic != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(Error::MachO(format!(
                "unexpected code signature magic {magic:#010x}"
            )));
        }
        let length = read_be32(data, 4) as usize;
        let count = read_be32(data, 8) as usize;
        if length > data.len() || SUPERBLOB_HEADER_SIZE + count * INDEX_ENTRY_SIZE > length {
            return Err(Error::MachO("code signature length out of bounds".into()));
        }
        let data = &data[..length];

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let slot = read_be32(data, at);
            let offset = read_be32(data, at + 4) as usize;
            if offset + BLOB_HEADER_SIZE > data.len() {
                return Err(Error::MachO(format!("blob for slot {slot:#x} out of bounds")));
            }
            let blob_len = read_be32(data, offset + 4) as usize;
            if blob_len < BLOB_HEADER_SIZE || offset + blob_len > data.len() {
                return Err(Error::MachO(format!("blob for slot {slot:#x} truncated")));
            }
            entries.push((slot, &data[offset..offset + blob_len]));
        }

        Ok(Self { entries })
    }

    /// Raw blob (header included) stored in `slot`.
    pub fn get(&self, slot: u32) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, blob)| *blob)
    }

    pub fn slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(s, _)| *s)
    }

    /// All CodeDirectory blobs: the primary slot first, then alternates.
    pub fn code_directories(&self) -> Vec<&'a [u8]> {
        self.entries
            .iter()
            .filter(|(slot, _)| {
                *slot == CSSLOT_CODEDIRECTORY
                    || (CSSLOT_ALTERNATE_CODEDIRECTORIES..CSSLOT_ALTERNATE_CODEDIRECTORIES + 5)
                        .contains(slot)
            })
            .map(|(_, blob)| *blob)
            .collect()
    }

    /// CMS bytes, or `None` for ad-hoc signatures.
    pub fn cms(&self) -> Option<&'a [u8]> {
        self.get(CSSLOT_SIGNATURESLOT)
            .map(blob_payload)
            .filter(|payload| !payload.is_empty())
    }
}

pub(crate) fn read_be32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblob_orders_slots() {
        let blob = SuperBlobBuilder::new()
            .blob(CSSLOT_SIGNATURESLOT, signature_blob(&[]))
            .blob(CSSLOT_REQUIREMENTS, empty_requirements_blob())
            .blob(CSSLOT_CODEDIRECTORY, wrap_blob(CSMAGIC_CODEDIRECTORY, &[0xab; 40]))
            .build();

        assert_eq!(read_be32(&blob, 0), CSMAGIC_EMBEDDED_SIGNATURE);
        assert_eq!(read_be32(&blob, 4) as usize, blob.len());
        assert_eq!(read_be32(&blob, 8), 3);

        let parsed = SuperBlob::parse(&blob).unwrap();
        let slots: Vec<_> = parsed.slots().collect();
        assert_eq!(
            slots,
            vec![CSSLOT_CODEDIRECTORY, CSSLOT_REQUIREMENTS, CSSLOT_SIGNATURESLOT]
        );
        assert_eq!(parsed.code_directories().len(), 1);
        assert!(parsed.cms().is_none());
    }

    #[test]
    fn test_parse_ignores_padding() {
        let mut blob = SuperBlobBuilder::new()
            .blob(CSSLOT_ENTITLEMENTS, entitlements_blob(b"<plist/>"))
            .build();
        blob.extend([0u8; 64]);

        let parsed = SuperBlob::parse(&blob).unwrap();
        let ent = parsed.get(CSSLOT_ENTITLEMENTS).unwrap();
        assert_eq!(blob_payload(ent), b"<plist/>");
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut blob = SuperBlobBuilder::new().build();
        blob[0] = 0;
        assert!(SuperBlob::parse(&blob).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_blob() {
        let mut blob = SuperBlobBuilder::new()
            .blob(CSSLOT_REQUIREMENTS, empty_requirements_blob())
            .build();
        // Inflate the inner blob length past the end of the SuperBlob.
        let inner = blob.len() - 12;
        blob[inner + 4..inner + 8].copy_from_slice(&1000u32.to_be_bytes());
        assert!(SuperBlob::parse(&blob).is_err());
    }

    #[test]
    fn test_builder_len_matches_output() {
        let builder = SuperBlobBuilder::new()
            .blob(CSSLOT_REQUIREMENTS, empty_requirements_blob())
            .blob(CSSLOT_ENTITLEMENTS, entitlements_blob(b"abc"));
        let expected = builder.len();
        assert_eq!(builder.build().len(), expected);
    }
}
