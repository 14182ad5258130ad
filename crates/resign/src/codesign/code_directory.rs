//! CodeDirectory construction and parsing.
//!
//! A CodeDirectory binds a binary to its signature: it holds one digest per
//! 4 KiB page of the signed range plus the special-slot digests (Info.plist,
//! requirements, CodeResources, entitlements). The CMS signature then covers
//! the hash of the CodeDirectory itself (the CDHash).
//!
//! Special slots are addressed by positive index and stored before the code
//! hashes in descending order, so slot `n` lives at `hash_offset - n * size`.

use super::blob::read_be32;
use super::constants::*;
use crate::{Error, Result};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::collections::BTreeMap;

/// Header size for version 0x20400.
const HEADER_SIZE: usize = 88;

/// Lowest special slot count emitted. Slots 1 to 3 are always present.
const MIN_SPECIAL_SLOTS: u32 = 3;

/// Digest algorithm of a CodeDirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Sha1,
    Sha256,
}

impl HashKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            CS_HASHTYPE_SHA1 => Some(HashKind::Sha1),
            CS_HASHTYPE_SHA256 => Some(HashKind::Sha256),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            HashKind::Sha1 => CS_HASHTYPE_SHA1,
            HashKind::Sha256 => CS_HASHTYPE_SHA256,
        }
    }

    pub fn len(self) -> usize {
        match self {
            HashKind::Sha1 => CS_SHA1_LEN,
            HashKind::Sha256 => CS_SHA256_LEN,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Sha1 => Sha1::digest(data).to_vec(),
            HashKind::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Builds CodeDirectory blobs over a borrowed code range.
///
/// Special-slot content is given raw and hashed once per [`HashKind`] at
/// build time, so one builder yields both the SHA-1 and SHA-256 directory.
///
/// ```ignore
/// let builder = CodeDirectoryBuilder::new("com.example.app", &image[..sig_offset])
///     .team_id("ABCDE12345")
///     .special_slot(CSSLOT_REQUIREMENTS, empty_requirements_blob())
///     .exec_segment(text_size, CS_EXECSEG_MAIN_BINARY);
/// let primary = builder.build(HashKind::Sha256);
/// ```
#[derive(Debug, Clone)]
pub struct CodeDirectoryBuilder<'a> {
    identifier: String,
    team_id: Option<String>,
    code: &'a [u8],
    special: BTreeMap<u32, Vec<u8>>,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    flags: u32,
}

impl<'a> CodeDirectoryBuilder<'a> {
    pub fn new(identifier: impl Into<String>, code: &'a [u8]) -> Self {
        Self {
            identifier: identifier.into(),
            team_id: None,
            code,
            special: BTreeMap::new(),
            exec_seg_base: 0,
            exec_seg_limit: 0,
            exec_seg_flags: 0,
            flags: 0,
        }
    }

    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Register the content hashed into special slot `slot`.
    ///
    /// For Info.plist and CodeResources this is the file content, for the
    /// other slots the complete blob including its header.
    pub fn special_slot(mut self, slot: u32, content: Vec<u8>) -> Self {
        self.special.insert(slot, content);
        self
    }

    pub fn exec_segment(mut self, base: u64, limit: u64, flags: u64) -> Self {
        self.exec_seg_base = base;
        self.exec_seg_limit = limit;
        self.exec_seg_flags = flags;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    fn is_main_executable(&self) -> bool {
        self.exec_seg_flags & CS_EXECSEG_MAIN_BINARY != 0
    }

    /// Number of special slots written.
    ///
    /// The DER entitlements slot is only emitted for main executables.
    fn special_slot_count(&self) -> u32 {
        let highest = self
            .special
            .keys()
            .copied()
            .filter(|slot| *slot != CSSLOT_DER_ENTITLEMENTS || self.is_main_executable())
            .max()
            .unwrap_or(0);
        highest.max(MIN_SPECIAL_SLOTS)
    }

    /// Size of the blob [`build`](Self::build) produces for `kind`.
    pub fn encoded_len(&self, kind: HashKind) -> usize {
        let strings = self.identifier.len() + 1 + self.team_id.as_ref().map_or(0, |t| t.len() + 1);
        let slots = self.special_slot_count() as usize + self.code.len().div_ceil(PAGE_SIZE);
        HEADER_SIZE + strings + slots * kind.len()
    }

    pub fn build(&self, kind: HashKind) -> Vec<u8> {
        let hash_size = kind.len();
        let code_limit = self.code.len();
        let n_code_slots = code_limit.div_ceil(PAGE_SIZE);
        let n_special_slots = self.special_slot_count();

        let ident_offset = HEADER_SIZE;
        let mut strings = Vec::with_capacity(self.identifier.len() + 12);
        strings.extend(self.identifier.as_bytes());
        strings.push(0);
        let team_offset = match &self.team_id {
            Some(team) => {
                let at = ident_offset + strings.len();
                strings.extend(team.as_bytes());
                strings.push(0);
                at
            }
            None => 0,
        };

        let hash_offset = ident_offset + strings.len() + n_special_slots as usize * hash_size;
        let total = hash_offset + n_code_slots * hash_size;

        let mut buf = Vec::with_capacity(total);
        buf.extend(CSMAGIC_CODEDIRECTORY.to_be_bytes());
        buf.extend((total as u32).to_be_bytes());
        buf.extend(CODEDIRECTORY_VERSION.to_be_bytes());
        buf.extend(self.flags.to_be_bytes());
        buf.extend((hash_offset as u32).to_be_bytes());
        buf.extend((ident_offset as u32).to_be_bytes());
        buf.extend(n_special_slots.to_be_bytes());
        buf.extend((n_code_slots as u32).to_be_bytes());
        buf.extend((code_limit as u32).to_be_bytes());
        buf.push(hash_size as u8);
        buf.push(kind.code());
        buf.push(0); // platform
        buf.push(PAGE_SIZE_LOG2);
        buf.extend(0u32.to_be_bytes()); // spare2
        buf.extend(0u32.to_be_bytes()); // scatterOffset
        buf.extend((team_offset as u32).to_be_bytes());
        buf.extend(0u32.to_be_bytes()); // spare3
        buf.extend(0u64.to_be_bytes()); // codeLimit64
        buf.extend(self.exec_seg_base.to_be_bytes());
        buf.extend(self.exec_seg_limit.to_be_bytes());
        buf.extend(self.exec_seg_flags.to_be_bytes());
        debug_assert_eq!(buf.len(), HEADER_SIZE);

        buf.extend(&strings);

        let empty = vec![0u8; hash_size];
        for slot in (1..=n_special_slots).rev() {
            match self.special.get(&slot) {
                Some(content) if slot != CSSLOT_DER_ENTITLEMENTS || self.is_main_executable() => {
                    buf.extend(kind.digest(content))
                }
                _ => buf.extend(&empty),
            }
        }

        for page in self.code.chunks(PAGE_SIZE) {
            buf.extend(kind.digest(page));
        }

        buf
    }
}

/// A parsed CodeDirectory, used to check an existing signature.
#[derive(Debug, Clone)]
pub struct CodeDirectory<'a> {
    pub flags: u32,
    pub kind: HashKind,
    pub identifier: String,
    pub team_id: Option<String>,
    pub code_limit: usize,
    page_size: usize,
    n_special_slots: usize,
    n_code_slots: usize,
    hash_offset: usize,
    data: &'a [u8],
}

impl<'a> CodeDirectory<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 44 || read_be32(data, 0) != CSMAGIC_CODEDIRECTORY {
            return Err(Error::MachO("not a CodeDirectory".into()));
        }
        let length = read_be32(data, 4) as usize;
        if length > data.len() {
            return Err(Error::MachO("CodeDirectory truncated".into()));
        }
        let data = &data[..length];

        let flags = read_be32(data, 12);
        let hash_offset = read_be32(data, 16) as usize;
        let ident_offset = read_be32(data, 20) as usize;
        let n_special_slots = read_be32(data, 24) as usize;
        let n_code_slots = read_be32(data, 28) as usize;
        let code_limit = read_be32(data, 32) as usize;
        let hash_size = data[36] as usize;
        let kind = HashKind::from_code(data[37])
            .ok_or_else(|| Error::MachO(format!("unsupported hash type {}", data[37])))?;
        if hash_size != kind.len() {
            return Err(Error::MachO("CodeDirectory hash size mismatch".into()));
        }
        let page_size = match data[39] {
            0 => 0,
            log2 if log2 < 32 => 1usize << log2,
            _ => return Err(Error::MachO("invalid CodeDirectory page size".into())),
        };

        let team_offset = if data.len() >= 52 && read_be32(data, 8) >= 0x20200 {
            read_be32(data, 48) as usize
        } else {
            0
        };

        if hash_offset < n_special_slots * hash_size
            || hash_offset + n_code_slots * hash_size > data.len()
        {
            return Err(Error::MachO("CodeDirectory hash table out of bounds".into()));
        }

        let identifier = read_c_string(data, ident_offset)
            .ok_or_else(|| Error::MachO("CodeDirectory identifier out of bounds".into()))?;
        let team_id = match team_offset {
            0 => None,
            at => read_c_string(data, at),
        };

        Ok(Self {
            flags,
            kind,
            identifier,
            team_id,
            code_limit,
            page_size,
            n_special_slots,
            n_code_slots,
            hash_offset,
            data,
        })
    }

    pub fn is_adhoc(&self) -> bool {
        self.flags & CS_ADHOC != 0
    }

    /// Stored digest for special slot `slot`, `None` when out of range or zero.
    pub fn special_hash(&self, slot: usize) -> Option<&'a [u8]> {
        if slot == 0 || slot > self.n_special_slots {
            return None;
        }
        let size = self.kind.len();
        let at = self.hash_offset - slot * size;
        let hash = &self.data[at..at + size];
        if hash.iter().all(|b| *b == 0) {
            None
        } else {
            Some(hash)
        }
    }

    /// Check that `content` matches special slot `slot`. A missing slot
    /// matches nothing.
    pub fn matches_special(&self, slot: usize, content: &[u8]) -> bool {
        self.special_hash(slot)
            .is_some_and(|hash| hash == self.kind.digest(content).as_slice())
    }

    /// Recompute every page digest over `code` and compare.
    pub fn matches_code(&self, code: &[u8]) -> bool {
        if code.len() < self.code_limit {
            return false;
        }
        let code = &code[..self.code_limit];
        let size = self.kind.len();

        let pages: Vec<&[u8]> = if self.page_size == 0 {
            vec![code]
        } else {
            code.chunks(self.page_size).collect()
        };
        if pages.len() != self.n_code_slots {
            return false;
        }

        pages.iter().enumerate().all(|(i, page)| {
            let at = self.hash_offset + i * size;
            self.data[at..at + size] == self.kind.digest(page)[..]
        })
    }

    /// CDHash of this directory.
    pub fn cdhash(&self) -> Vec<u8> {
        self.kind.digest(self.data)
    }
}

fn read_c_string(data: &[u8], offset: usize) -> Option<String> {
    let tail = data.get(offset..)?;
    let end = tail.iter().position(|b| *b == 0)?;
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}
