//! Splitting universal binaries into slices and reassembling them.

use crate::{Error, Result};
use goblin::mach::Mach;
use std::ops::Range;

const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;

/// One `fat_arch` entry, without its offset and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatEntry {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub align: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
    Thin,
    Fat(Vec<FatEntry>),
}

impl Container {
    pub fn is_fat(&self) -> bool {
        matches!(self, Container::Fat(_))
    }
}

/// Byte range of every slice of `data`.
pub fn slice_ranges(data: &[u8]) -> Result<(Container, Vec<Range<usize>>)> {
    match Mach::parse(data).map_err(|e| Error::MachO(e.to_string()))? {
        Mach::Binary(_) => Ok((Container::Thin, vec![0..data.len()])),
        Mach::Fat(multi) => {
            let mut entries = Vec::new();
            let mut ranges = Vec::new();
            for arch in multi.iter_arches() {
                let arch = arch.map_err(|e| Error::MachO(format!("bad fat arch: {e}")))?;
                let start = arch.offset as usize;
                let end = start + arch.size as usize;
                if end > data.len() {
                    return Err(Error::MachO("fat slice out of bounds".into()));
                }
                entries.push(FatEntry {
                    cputype: arch.cputype,
                    cpusubtype: arch.cpusubtype,
                    align: arch.align,
                });
                ranges.push(start..end);
            }
            if ranges.is_empty() {
                return Err(Error::MachO("universal binary has no slices".into()));
            }
            Ok((Container::Fat(entries), ranges))
        }
    }
}

/// Borrow every slice of `data`.
pub fn slices(data: &[u8]) -> Result<(Container, Vec<&[u8]>)> {
    let (container, ranges) = slice_ranges(data)?;
    Ok((container, ranges.into_iter().map(|r| &data[r]).collect()))
}

/// Copy every slice of `data` for editing.
pub fn split(data: &[u8]) -> Result<(Container, Vec<Vec<u8>>)> {
    let (container, parts) = slices(data)?;
    Ok((container, parts.into_iter().map(<[u8]>::to_vec).collect()))
}

/// Reassemble slices, recomputing fat offsets from each arch's alignment.
pub fn join(container: &Container, mut slices: Vec<Vec<u8>>) -> Vec<u8> {
    let entries = match container {
        Container::Thin => return slices.pop().unwrap_or_default(),
        Container::Fat(entries) => entries,
    };

    let mut placed = Vec::with_capacity(entries.len());
    let mut cursor = FAT_HEADER_SIZE + entries.len() * FAT_ARCH_SIZE;
    for (entry, slice) in entries.iter().zip(&slices) {
        let alignment = 1usize << entry.align.min(20);
        cursor = super::layout::align(cursor, alignment);
        placed.push(cursor);
        cursor += slice.len();
    }

    let mut out = vec![0u8; cursor];
    out[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
    out[4..8].copy_from_slice(&(entries.len() as u32).to_be_bytes());
    for (i, (entry, slice)) in entries.iter().zip(&slices).enumerate() {
        let at = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
        let fields = [
            entry.cputype,
            entry.cpusubtype,
            placed[i] as u32,
            slice.len() as u32,
            entry.align,
        ];
        for (j, value) in fields.iter().enumerate() {
            out[at + j * 4..at + j * 4 + 4].copy_from_slice(&value.to_be_bytes());
        }
        out[placed[i]..placed[i] + slice.len()].copy_from_slice(slice);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::layout::tests::synthetic_macho;
    use goblin::mach::header::MH_EXECUTE;

    #[test]
    fn test_thin_roundtrip() {
        let data = synthetic_macho(MH_EXECUTE);
        let (container, parts) = split(&data).unwrap();
        assert_eq!(container, Container::Thin);
        assert_eq!(join(&container, parts), data);
    }

    #[test]
    fn test_fat_join_then_split() {
        let slice = synthetic_macho(MH_EXECUTE);
        let container = Container::Fat(vec![
            FatEntry {
                cputype: 0x0100_000c,
                cpusubtype: 0,
                align: 14,
            },
            FatEntry {
                cputype: 0x0100_000c,
                cpusubtype: 2,
                align: 14,
            },
        ]);
        let fat = join(&container, vec![slice.clone(), slice.clone()]);
        assert_eq!(&fat[..4], &FAT_MAGIC.to_be_bytes());

        let (parsed, parts) = slices(&fat).unwrap();
        assert_eq!(parsed, container);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| *p == slice.as_slice()));
    }
}
