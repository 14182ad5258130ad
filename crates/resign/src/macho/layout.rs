//! Layout of a single-architecture Mach-O slice and in-place edits to its
//! load commands.
//!
//! Only little-endian images are handled, which covers every iOS target.
//! Edits never move existing bytes: new load commands go into the zero
//! padding between the last load command and the first section.

use crate::{Error, Result};
use goblin::mach::header::{MH_EXECUTE, MH_MAGIC, MH_MAGIC_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::MachO;

pub const LC_LOAD_DYLIB: u32 = 0x0c;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;

const HEADER_SIZE_32: usize = 28;
const HEADER_SIZE_64: usize = 32;
const LINKEDIT_DATA_COMMAND_SIZE: u32 = 16;
const DYLIB_COMMAND_SIZE: usize = 24;

/// Segments are mapped in 16 KiB pages on arm64.
const SEGMENT_ALIGN: u64 = 0x4000;

/// A `segment_command(_64)` location and its file range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub command_offset: usize,
    pub fileoff: u64,
    pub filesize: u64,
    pub vmsize: u64,
}

/// An existing `LC_CODE_SIGNATURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureLocation {
    pub command_offset: usize,
    pub dataoff: u32,
    pub datasize: u32,
}

/// A linked dynamic library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedDylib {
    pub path: String,
    pub weak: bool,
}

/// Structural facts about one slice.
#[derive(Debug, Clone)]
pub struct SliceLayout {
    pub is_64: bool,
    pub cputype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    header_size: usize,
    /// First byte the load commands may not grow into.
    load_command_limit: usize,
    pub text: Option<Segment>,
    pub linkedit: Option<Segment>,
    pub signature: Option<SignatureLocation>,
    pub dylibs: Vec<LinkedDylib>,
}

impl SliceLayout {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let magic = data
            .get(..4)
            .map(|m| read_u32(m, 0))
            .ok_or_else(|| Error::MachO("file too small".into()))?;
        let is_64 = match magic {
            MH_MAGIC_64 => true,
            MH_MAGIC => false,
            other => {
                return Err(Error::MachO(format!(
                    "unsupported magic {other:#010x} (only little-endian Mach-O is handled)"
                )))
            }
        };
        let macho = MachO::parse(data, 0).map_err(|e| Error::MachO(e.to_string()))?;

        let header_size = if is_64 { HEADER_SIZE_64 } else { HEADER_SIZE_32 };
        let mut layout = SliceLayout {
            is_64,
            cputype: read_u32(data, 4),
            filetype: read_u32(data, 12),
            ncmds: read_u32(data, 16),
            sizeofcmds: read_u32(data, 20),
            header_size,
            load_command_limit: data.len(),
            text: None,
            linkedit: None,
            signature: None,
            dylibs: Vec::new(),
        };

        for lc in &macho.load_commands {
            let at = lc.offset;
            match &lc.command {
                CommandVariant::Segment64(seg) => {
                    let segment = Segment {
                        command_offset: at,
                        fileoff: seg.fileoff,
                        filesize: seg.filesize,
                        vmsize: seg.vmsize,
                    };
                    layout.note_segment(&seg.segname, segment);
                    layout.note_sections(data, at + 72, seg.nsects as usize, 80, 48);
                }
                CommandVariant::Segment32(seg) => {
                    let segment = Segment {
                        command_offset: at,
                        fileoff: seg.fileoff as u64,
                        filesize: seg.filesize as u64,
                        vmsize: seg.vmsize as u64,
                    };
                    layout.note_segment(&seg.segname, segment);
                    layout.note_sections(data, at + 56, seg.nsects as usize, 68, 40);
                }
                CommandVariant::CodeSignature(cs) => {
                    layout.signature = Some(SignatureLocation {
                        command_offset: at,
                        dataoff: cs.dataoff,
                        datasize: cs.datasize,
                    });
                }
                CommandVariant::LoadDylib(d)
                | CommandVariant::ReexportDylib(d)
                | CommandVariant::LazyLoadDylib(d)
                | CommandVariant::LoadUpwardDylib(d) => {
                    if let Some(path) = read_c_string(data, at + d.dylib.name as usize) {
                        layout.dylibs.push(LinkedDylib { path, weak: false });
                    }
                }
                CommandVariant::LoadWeakDylib(d) => {
                    if let Some(path) = read_c_string(data, at + d.dylib.name as usize) {
                        layout.dylibs.push(LinkedDylib { path, weak: true });
                    }
                }
                _ => {}
            }
        }

        if layout.load_commands_end() > layout.load_command_limit {
            return Err(Error::MachO("load commands overlap section data".into()));
        }
        Ok(layout)
    }

    fn note_segment(&mut self, name: &[u8; 16], segment: Segment) {
        if segment.fileoff > 0 && segment.filesize > 0 {
            self.load_command_limit = self.load_command_limit.min(segment.fileoff as usize);
        }
        match segment_name(name) {
            "__TEXT" => self.text = Some(segment),
            "__LINKEDIT" => self.linkedit = Some(segment),
            _ => {}
        }
    }

    fn note_sections(
        &mut self,
        data: &[u8],
        first: usize,
        count: usize,
        stride: usize,
        offset_field: usize,
    ) {
        for i in 0..count {
            let at = first + i * stride + offset_field;
            if at + 4 > data.len() {
                break;
            }
            let offset = read_u32(data, at) as usize;
            if offset > 0 {
                self.load_command_limit = self.load_command_limit.min(offset);
            }
        }
    }

    pub fn is_executable(&self) -> bool {
        self.filetype == MH_EXECUTE
    }

    pub fn load_commands_end(&self) -> usize {
        self.header_size + self.sizeofcmds as usize
    }

    /// Bytes still free between the load commands and the first section.
    pub fn free_command_space(&self) -> usize {
        self.load_command_limit
            .saturating_sub(self.load_commands_end())
    }

    /// End of the signed range: the existing signature offset, else the end
    /// of `__LINKEDIT`, else the file end.
    pub fn code_end(&self, file_len: usize) -> usize {
        if let Some(sig) = self.signature {
            return (sig.dataoff as usize).min(file_len);
        }
        match self.linkedit {
            Some(seg) => ((seg.fileoff + seg.filesize) as usize).min(file_len),
            None => file_len,
        }
    }

    pub fn links(&self, path: &str) -> bool {
        self.dylibs.iter().any(|d| d.path == path)
    }

    fn command_align(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }
}

/// Append a dylib load command into the load-command padding.
pub fn add_dylib(data: &mut [u8], layout: &SliceLayout, path: &str, weak: bool) -> Result<()> {
    let cmdsize = align(DYLIB_COMMAND_SIZE + path.len() + 1, layout.command_align());
    let at = layout.load_commands_end();
    if cmdsize > layout.free_command_space() {
        return Err(Error::MachO(format!(
            "not enough load command space for {path} ({} bytes free, {cmdsize} needed)",
            layout.free_command_space()
        )));
    }
    if data[at..at + cmdsize].iter().any(|b| *b != 0) {
        return Err(Error::MachO("load command padding is not empty".into()));
    }

    // Keep a trailing LC_CODE_SIGNATURE last.
    let mut at = at;
    if let Some(sig) = layout.signature {
        let sig_size = LINKEDIT_DATA_COMMAND_SIZE as usize;
        if sig.command_offset + sig_size == at {
            data.copy_within(sig.command_offset..at, sig.command_offset + cmdsize);
            data[sig.command_offset..sig.command_offset + cmdsize].fill(0);
            at = sig.command_offset;
        }
    }

    let cmd = if weak {
        LC_LOAD_WEAK_DYLIB
    } else {
        LC_LOAD_DYLIB
    };
    write_u32(data, at, cmd);
    write_u32(data, at + 4, cmdsize as u32);
    write_u32(data, at + 8, DYLIB_COMMAND_SIZE as u32);
    write_u32(data, at + 12, 2); // timestamp
    write_u32(data, at + 16, 0); // current_version
    write_u32(data, at + 20, 0); // compatibility_version
    data[at + DYLIB_COMMAND_SIZE..at + DYLIB_COMMAND_SIZE + path.len()]
        .copy_from_slice(path.as_bytes());

    bump_command_count(data, layout, cmdsize as u32);
    Ok(())
}

/// Point `LC_CODE_SIGNATURE` at `[dataoff, dataoff + datasize)`, grow
/// `__LINKEDIT` over it and size the slice to end exactly there.
///
/// Everything from `dataoff` on is zeroed so the signature can be written
/// after the code pages are hashed.
pub fn reserve_signature(
    data: &mut Vec<u8>,
    layout: &SliceLayout,
    dataoff: usize,
    datasize: usize,
) -> Result<()> {
    let linkedit = layout
        .linkedit
        .ok_or_else(|| Error::MachO("no __LINKEDIT segment".into()))?;
    if (dataoff as u64) < linkedit.fileoff {
        return Err(Error::MachO("signature would start before __LINKEDIT".into()));
    }

    match layout.signature {
        Some(sig) => {
            write_u32(data, sig.command_offset + 8, dataoff as u32);
            write_u32(data, sig.command_offset + 12, datasize as u32);
        }
        None => {
            let needed = LINKEDIT_DATA_COMMAND_SIZE as usize;
            if needed > layout.free_command_space() {
                return Err(Error::MachO(
                    "not enough load command space for LC_CODE_SIGNATURE".into(),
                ));
            }
            let at = layout.load_commands_end();
            write_u32(data, at, LC_CODE_SIGNATURE);
            write_u32(data, at + 4, LINKEDIT_DATA_COMMAND_SIZE);
            write_u32(data, at + 8, dataoff as u32);
            write_u32(data, at + 12, datasize as u32);
            bump_command_count(data, layout, LINKEDIT_DATA_COMMAND_SIZE);
        }
    }

    let filesize = (dataoff + datasize) as u64 - linkedit.fileoff;
    let vmsize = linkedit.vmsize.max(align_u64(filesize, SEGMENT_ALIGN));
    let at = linkedit.command_offset;
    if layout.is_64 {
        write_u64(data, at + 32, vmsize);
        write_u64(data, at + 48, filesize);
    } else {
        write_u32(data, at + 28, vmsize as u32);
        write_u32(data, at + 36, filesize as u32);
    }

    data.truncate(dataoff);
    data.resize(dataoff + datasize, 0);
    Ok(())
}

fn bump_command_count(data: &mut [u8], layout: &SliceLayout, added: u32) {
    write_u32(data, 16, layout.ncmds + 1);
    write_u32(data, 20, layout.sizeofcmds + added);
}

fn segment_name(raw: &[u8; 16]) -> &str {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

fn read_c_string(data: &[u8], offset: usize) -> Option<String> {
    let tail = data.get(offset..)?;
    let end = tail.iter().position(|b| *b == 0)?;
    std::str::from_utf8(&tail[..end]).ok().map(str::to_owned)
}

pub fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

fn align_u64(value: u64, to: u64) -> u64 {
    (value + to - 1) & !(to - 1)
}

pub fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
