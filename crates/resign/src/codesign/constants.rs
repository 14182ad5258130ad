//! Apple code signing magic numbers, slot indices and flags.

// Blob magics

pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

// SuperBlob index slots

pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;
pub const CSSLOT_INFOSLOT: u32 = 0x0001;
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;
pub const CSSLOT_RESOURCEDIR: u32 = 0x0003;
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

// Hash types

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const CS_SHA1_LEN: usize = 20;
pub const CS_SHA256_LEN: usize = 32;

// CodeDirectory flags

pub const CS_ADHOC: u32 = 0x0000_0002;

// Exec segment flags

pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;
pub const CS_EXECSEG_ALLOW_UNSIGNED: u64 = 0x0010;

/// CodeDirectory version carrying the exec segment fields.
pub const CODEDIRECTORY_VERSION: u32 = 0x20400;

/// Code pages are hashed in 4 KiB chunks.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_LOG2: u8 = 12;
