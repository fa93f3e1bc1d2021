// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Universal binary archives.
//!
//! A universal binary bundles compiled code for several targets together with the function
//! descriptions for each.  All values are little-endian `u32`s:
//!
//! ```text
//! magic[4] version entry_count
//! entry headers:  v1: function_count data_word_count
//!                 v2: function_count data_word_count format variant
//! payload:        u32[sum(data_word_count)]
//! per entry:      function_type[function_count]
//!                 function_count names, NUL-terminated, padded to 4 bytes
//!                 v2 only, per function:
//!                     arg_count, per arg: kind size array_extent access
//!                                         image_type_lo image_type_hi argument_buffer_index
//!                     required_local_size[3] required_simd_width flags
//! ```
//!
//! Version 1 archives use the legacy `SPVC` magic and always hold SPIR-V.  Version 2 archives
//! use `FUBA`; both magics are accepted on load.

use std::path::Path;
use std::sync::Arc;

use crate::device::{Device, PlatformType};
use crate::function_info::{
    ArgAccess, ArgInfo, ArgKind, FunctionFlags, FunctionInfo, FunctionType,
};
use crate::image_type::ImageType;

pub const LEGACY_MAGIC: [u8; 4] = *b"SPVC";
pub const MAGIC: [u8; 4] = *b"FUBA";
pub const CURRENT_VERSION: u32 = 2;

const NO_ARGUMENT_BUFFER: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ArchiveError {
    #[error("file is too small to hold a header ({0} bytes)")]
    TooSmall(usize),
    #[error("unknown magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported container version {0}")]
    UnsupportedVersion(u32),
    #[error("archive contains no entries")]
    NoEntries,
    #[error("entry headers are truncated")]
    TruncatedHeaders,
    #[error("entry {entry} has an invalid size (functions {functions}, words {words})")]
    InvalidEntrySize {
        entry: usize,
        functions: u32,
        words: u32,
    },
    #[error("payload is truncated: need {needed} words, have {available}")]
    TruncatedPayload { needed: usize, available: usize },
    #[error("entry {entry}: function type table is truncated")]
    TruncatedFunctionTypes { entry: usize },
    #[error("entry {entry}: invalid function type {value}")]
    InvalidFunctionType { entry: usize, value: u32 },
    #[error("entry {entry}: name of function {function} is missing its terminator")]
    MissingTerminator { entry: usize, function: usize },
    #[error("entry {entry}: name of function {function} is not valid UTF-8")]
    InvalidName { entry: usize, function: usize },
    #[error("entry {entry}: function info of function {function} is truncated")]
    TruncatedFunctionInfo { entry: usize, function: usize },
    #[error("entry {entry}: function {function} has an invalid argument record")]
    InvalidArgument { entry: usize, function: usize },
    #[error("entry {entry}: unknown target format {format}")]
    InvalidTarget { entry: usize, format: u32 },
    #[error("{0} trailing bytes after the last entry")]
    TrailingData(usize),
}

/// Kind of code stored in an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BinaryFormat {
    Ptx = 0,
    MetalAir = 1,
    SpirvVulkan = 2,
    SpirvOpenCl = 3,
    HostElf = 4,
}

impl BinaryFormat {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => BinaryFormat::Ptx,
            1 => BinaryFormat::MetalAir,
            2 => BinaryFormat::SpirvVulkan,
            3 => BinaryFormat::SpirvOpenCl,
            4 => BinaryFormat::HostElf,
            _ => return None,
        })
    }
}

/// Compilation target of an entry.
///
/// `variant` is format specific: the SM version for PTX, the packed SPIR-V / AIR version, or the
/// ELF machine number for host code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub format: BinaryFormat,
    pub variant: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryEntry {
    pub target: Target,
    pub code: Vec<u8>,
    pub functions: Vec<Arc<FunctionInfo>>,
    /// Version 1 entries carry names and types only.
    pub has_arg_info: bool,
}

impl BinaryEntry {
    pub fn function(&self, name: &str) -> Option<&Arc<FunctionInfo>> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniversalBinary {
    pub version: u32,
    pub entries: Vec<BinaryEntry>,
}

struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
    fn u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.position..self.position + 4)?;
        self.position += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.position..self.position.checked_add(len)?)?;
        self.position += len;
        Some(bytes)
    }
    /// A NUL-terminated string padded to 4 bytes.
    fn padded_str(&mut self) -> Result<&'a [u8], ()> {
        let rest = &self.data[self.position..];
        let len = rest.iter().position(|b| *b == 0).ok_or(())?;
        let padded = (len + 1).next_multiple_of(4);
        if padded > rest.len() {
            return Err(());
        }
        self.position += padded;
        Ok(&rest[..len])
    }
}

impl UniversalBinary {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        let data = std::fs::read(path.as_ref())?;
        Ok(Self::parse(&data)?)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ArchiveError> {
        if data.len() < 12 {
            return Err(ArchiveError::TooSmall(data.len()));
        }
        let mut reader = Reader { data, position: 0 };
        let magic: [u8; 4] = [data[0], data[1], data[2], data[3]];
        reader.position = 4;
        if magic != LEGACY_MAGIC && magic != MAGIC {
            return Err(ArchiveError::BadMagic(magic));
        }
        let version = reader.u32().ok_or(ArchiveError::TooSmall(data.len()))?;
        if version != 1 && version != 2 {
            return Err(ArchiveError::UnsupportedVersion(version));
        }
        let entry_count = reader.u32().ok_or(ArchiveError::TooSmall(data.len()))? as usize;
        if entry_count == 0 {
            return Err(ArchiveError::NoEntries);
        }
        let header_words = if version == 1 { 2 } else { 4 };
        if reader.remaining() / (4 * header_words) < entry_count {
            return Err(ArchiveError::TruncatedHeaders);
        }

        struct Header {
            function_count: u32,
            word_count: u32,
            target: Target,
        }
        let mut headers = Vec::with_capacity(entry_count);
        for entry in 0..entry_count {
            let function_count = reader.u32().ok_or(ArchiveError::TruncatedHeaders)?;
            let word_count = reader.u32().ok_or(ArchiveError::TruncatedHeaders)?;
            let target = if version == 1 {
                Target {
                    format: BinaryFormat::SpirvVulkan,
                    variant: 0,
                }
            } else {
                let format = reader.u32().ok_or(ArchiveError::TruncatedHeaders)?;
                let variant = reader.u32().ok_or(ArchiveError::TruncatedHeaders)?;
                Target {
                    format: BinaryFormat::from_u32(format)
                        .ok_or(ArchiveError::InvalidTarget { entry, format })?,
                    variant,
                }
            };
            if function_count == 0 || word_count == 0 {
                return Err(ArchiveError::InvalidEntrySize {
                    entry,
                    functions: function_count,
                    words: word_count,
                });
            }
            headers.push(Header {
                function_count,
                word_count,
                target,
            });
        }

        // offsets are assigned by walking the entry sizes
        let total_words: usize = headers.iter().map(|h| h.word_count as usize).sum();
        if reader.remaining() / 4 < total_words {
            return Err(ArchiveError::TruncatedPayload {
                needed: total_words,
                available: reader.remaining() / 4,
            });
        }
        let mut codes = Vec::with_capacity(entry_count);
        for header in &headers {
            let code = reader
                .bytes(header.word_count as usize * 4)
                .ok_or(ArchiveError::TruncatedPayload {
                    needed: total_words,
                    available: reader.remaining() / 4,
                })?;
            codes.push(code.to_vec());
        }

        let mut entries = Vec::with_capacity(entry_count);
        for (entry, (header, code)) in headers.into_iter().zip(codes).enumerate() {
            let function_count = header.function_count as usize;
            let mut types = Vec::with_capacity(function_count);
            for _ in 0..function_count {
                let value = reader
                    .u32()
                    .ok_or(ArchiveError::TruncatedFunctionTypes { entry })?;
                types.push(
                    FunctionType::from_u32(value)
                        .ok_or(ArchiveError::InvalidFunctionType { entry, value })?,
                );
            }
            let mut names = Vec::with_capacity(function_count);
            for function in 0..function_count {
                let raw = reader
                    .padded_str()
                    .map_err(|_| ArchiveError::MissingTerminator { entry, function })?;
                let name = std::str::from_utf8(raw)
                    .map_err(|_| ArchiveError::InvalidName { entry, function })?;
                names.push(name.to_string());
            }
            let functions = if version == 1 {
                names
                    .into_iter()
                    .zip(types)
                    .map(|(name, function_type)| {
                        Arc::new(FunctionInfo::kernel(name, Vec::new()).with_function_type(function_type))
                    })
                    .collect()
            } else {
                read_function_infos(&mut reader, entry, names, types)?
            };
            entries.push(BinaryEntry {
                target: header.target,
                code,
                functions,
                has_arg_info: version != 1,
            });
        }
        if reader.remaining() != 0 {
            return Err(ArchiveError::TrailingData(reader.remaining()));
        }
        Ok(UniversalBinary { version, entries })
    }

    /// Serializes the archive; version 1 writes the legacy layout and drops targets and args.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let push = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
        out.extend_from_slice(if self.version == 1 { &LEGACY_MAGIC } else { &MAGIC });
        push(&mut out, self.version);
        push(&mut out, self.entries.len() as u32);
        for entry in &self.entries {
            push(&mut out, entry.functions.len() as u32);
            push(&mut out, entry.code.len().div_ceil(4) as u32);
            if self.version != 1 {
                push(&mut out, entry.target.format as u32);
                push(&mut out, entry.target.variant);
            }
        }
        for entry in &self.entries {
            out.extend_from_slice(&entry.code);
            out.resize(out.len().next_multiple_of(4), 0);
        }
        for entry in &self.entries {
            for function in &entry.functions {
                push(&mut out, function.function_type as u32);
            }
            for function in &entry.functions {
                out.extend_from_slice(function.name.as_bytes());
                out.push(0);
                out.resize(out.len().next_multiple_of(4), 0);
            }
            if self.version == 1 {
                continue;
            }
            for function in &entry.functions {
                push(&mut out, function.args.len() as u32);
                for arg in &function.args {
                    let ab_index = arg
                        .argument_buffer
                        .as_ref()
                        .and_then(|ab| entry.functions.iter().position(|f| f.name == ab.name))
                        .map_or(NO_ARGUMENT_BUFFER, |i| i as u32);
                    push(&mut out, arg.kind as u32);
                    push(&mut out, arg.size);
                    push(&mut out, arg.array_extent);
                    push(&mut out, arg.access as u32);
                    push(&mut out, arg.image_type.bits() as u32);
                    push(&mut out, (arg.image_type.bits() >> 32) as u32);
                    push(&mut out, ab_index);
                }
                let local = function.required_local_size.unwrap_or([0; 3]);
                for v in local {
                    push(&mut out, v);
                }
                push(&mut out, function.required_simd_width.unwrap_or(0));
                push(&mut out, function.flags.bits());
            }
        }
        out
    }

    /// The best entry among `formats` (in preference order) whose variant does not exceed
    /// `max_variant`; within one format the highest variant wins.
    pub fn best_entry(&self, formats: &[BinaryFormat], max_variant: Option<u32>) -> Option<&BinaryEntry> {
        formats.iter().find_map(|format| {
            self.entries
                .iter()
                .filter(|e| e.target.format == *format)
                .filter(|e| max_variant.is_none_or(|max| e.target.variant <= max))
                .max_by_key(|e| e.target.variant)
        })
    }

    /// The entry a device of the given platform would load.
    pub fn best_entry_for(&self, device: &Device) -> Option<&BinaryEntry> {
        match device.platform {
            PlatformType::Host => self
                .entries
                .iter()
                .find(|e| e.target.format == BinaryFormat::HostElf && e.target.variant == host_elf_machine()),
            PlatformType::Vulkan | PlatformType::Metal => {
                self.best_entry(&[BinaryFormat::SpirvVulkan], None)
            }
            PlatformType::Cuda => self.best_entry(&[BinaryFormat::Ptx], None),
            PlatformType::OpenCl => self.best_entry(&[BinaryFormat::SpirvOpenCl], None),
        }
    }
}

/// ELF machine number of the running host.
pub fn host_elf_machine() -> u32 {
    if cfg!(target_arch = "aarch64") {
        183
    } else {
        62
    }
}

fn read_function_infos(
    reader: &mut Reader<'_>,
    entry: usize,
    names: Vec<String>,
    types: Vec<FunctionType>,
) -> Result<Vec<Arc<FunctionInfo>>, ArchiveError> {
    struct Pending {
        info: FunctionInfo,
        ab_links: Vec<(usize, usize)>,
    }
    let count = names.len();
    let mut pending = Vec::with_capacity(count);
    for (function, (name, function_type)) in names.into_iter().zip(types).enumerate() {
        let truncated = ArchiveError::TruncatedFunctionInfo { entry, function };
        let invalid = ArchiveError::InvalidArgument { entry, function };
        let arg_count = reader.u32().ok_or(truncated.clone())? as usize;
        if arg_count > reader.remaining() / 28 {
            return Err(truncated);
        }
        let mut args = Vec::with_capacity(arg_count);
        let mut ab_links = Vec::new();
        for arg_index in 0..arg_count {
            let mut word = || reader.u32().ok_or(truncated.clone());
            let kind = ArgKind::from_u32(word()?).ok_or(invalid.clone())?;
            let size = word()?;
            let array_extent = word()?;
            let access = ArgAccess::from_u32(word()?).ok_or(invalid.clone())?;
            let lo = word()? as u64;
            let hi = word()? as u64;
            let ab_index = word()?;
            if kind == ArgKind::ArgumentBuffer {
                if ab_index as usize >= count {
                    return Err(invalid);
                }
                ab_links.push((arg_index, ab_index as usize));
            }
            args.push(ArgInfo {
                kind,
                size,
                array_extent,
                access,
                image_type: ImageType::from_bits_retain(lo | (hi << 32)),
                argument_buffer: None,
            });
        }
        let mut word = || reader.u32().ok_or(truncated.clone());
        let local = [word()?, word()?, word()?];
        let simd = word()?;
        let flags = FunctionFlags::from_bits_retain(word()?);
        pending.push(Pending {
            info: FunctionInfo {
                name,
                function_type,
                flags,
                args,
                required_local_size: (local != [0; 3]).then_some(local),
                required_simd_width: (simd != 0).then_some(simd),
            },
            ab_links,
        });
    }

    // argument-buffer structs can't nest, so they are complete before any user links to them
    let mut structs: Vec<Option<Arc<FunctionInfo>>> = vec![None; count];
    for (index, p) in pending.iter().enumerate() {
        if p.info.function_type == FunctionType::ArgumentBufferStruct {
            if !p.ab_links.is_empty() {
                return Err(ArchiveError::InvalidArgument {
                    entry,
                    function: index,
                });
            }
            structs[index] = Some(Arc::new(p.info.clone()));
        }
    }
    pending
        .into_iter()
        .enumerate()
        .map(|(function, mut p)| {
            if let Some(existing) = &structs[function] {
                return Ok(existing.clone());
            }
            for (arg_index, target) in p.ab_links {
                let layout = structs[target]
                    .clone()
                    .ok_or(ArchiveError::InvalidArgument { entry, function })?;
                p.info.args[arg_index].argument_buffer = Some(layout);
            }
            Ok(Arc::new(p.info))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UniversalBinary {
        let params = Arc::new(
            FunctionInfo::kernel("params", vec![ArgInfo::buffer(ArgAccess::Read), ArgInfo::plain(8)])
                .with_function_type(FunctionType::ArgumentBufferStruct),
        );
        let kernel = Arc::new(
            FunctionInfo::kernel(
                "add_one",
                vec![
                    ArgInfo::buffer(ArgAccess::ReadWrite),
                    ArgInfo::plain(4),
                    ArgInfo::image(ImageType::IMAGE_2D | ImageType::RGBA8 | ImageType::READ, ArgAccess::Read),
                    ArgInfo::argument_buffer(params.clone()),
                ],
            )
            .with_flags(FunctionFlags::USES_SOFT_PRINTF)
            .with_required_local_size([64, 1, 1]),
        );
        UniversalBinary {
            version: 2,
            entries: vec![
                BinaryEntry {
                    target: Target {
                        format: BinaryFormat::SpirvVulkan,
                        variant: 0x10300,
                    },
                    code: vec![1, 2, 3, 4, 5, 6, 7, 8],
                    functions: vec![kernel.clone(), params.clone()],
                    has_arg_info: true,
                },
                BinaryEntry {
                    target: Target {
                        format: BinaryFormat::HostElf,
                        variant: 62,
                    },
                    code: vec![9, 10, 11, 12],
                    functions: vec![params, kernel],
                    has_arg_info: true,
                },
            ],
        }
    }

    #[test]
    fn write_then_parse() {
        let binary = sample();
        let bytes = binary.to_bytes();
        assert_eq!(&bytes[0..4], b"FUBA");
        let parsed = UniversalBinary::parse(&bytes).unwrap();
        assert_eq!(parsed, binary);
        let ab = parsed.entries[0].functions[0].args[3].argument_buffer.as_ref().unwrap();
        assert_eq!(ab.name, "params");
    }

    #[test]
    fn legacy_layout() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"SPVC");
        for v in [1u32, 1, 2, 1, 0x0723_0203] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        // function types
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(b"main\0\0\0\0");
        bytes.extend_from_slice(b"frag\0\0\0\0");
        let parsed = UniversalBinary::parse(&bytes).unwrap();
        assert_eq!(parsed.version, 1);
        let entry = &parsed.entries[0];
        assert_eq!(entry.target.format, BinaryFormat::SpirvVulkan);
        assert_eq!(entry.code, 0x0723_0203u32.to_le_bytes().to_vec());
        assert_eq!(entry.functions[1].name, "frag");
        assert_eq!(entry.functions[1].function_type, FunctionType::Fragment);
        assert!(!entry.has_arg_info);
        assert_eq!(UniversalBinary::parse(&parsed.to_bytes()).unwrap(), parsed);
    }

    #[test]
    fn rejects_corruption() {
        let bytes = sample().to_bytes();
        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(UniversalBinary::parse(&bad_magic), Err(ArchiveError::BadMagic(_))));

        let mut bad_version = bytes.clone();
        bad_version[4] = 9;
        assert_eq!(
            UniversalBinary::parse(&bad_version),
            Err(ArchiveError::UnsupportedVersion(9))
        );

        assert!(UniversalBinary::parse(&bytes[..bytes.len() - 4]).is_err());

        let mut trailing = bytes.clone();
        trailing.extend_from_slice(&[0; 4]);
        assert_eq!(UniversalBinary::parse(&trailing), Err(ArchiveError::TrailingData(4)));

        let mut zero_words = bytes.clone();
        zero_words[16..20].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            UniversalBinary::parse(&zero_words),
            Err(ArchiveError::InvalidEntrySize { entry: 0, .. })
        ));

        assert_eq!(UniversalBinary::parse(&[0; 8]), Err(ArchiveError::TooSmall(8)));
    }

    #[test]
    fn missing_terminator() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"SPVC");
        for v in [1u32, 1, 1, 1, 0xdead_beef, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(b"main");
        assert_eq!(
            UniversalBinary::parse(&bytes),
            Err(ArchiveError::MissingTerminator { entry: 0, function: 0 })
        );
    }

    #[test]
    fn target_selection() {
        let binary = sample();
        let spirv = binary.best_entry(&[BinaryFormat::SpirvVulkan], None).unwrap();
        assert_eq!(spirv.target.variant, 0x10300);
        assert!(binary.best_entry(&[BinaryFormat::SpirvVulkan], Some(0x10000)).is_none());
        assert!(binary.best_entry(&[BinaryFormat::Ptx], None).is_none());
        let host = binary.best_entry(&[BinaryFormat::Ptx, BinaryFormat::HostElf], None).unwrap();
        assert_eq!(host.target.format, BinaryFormat::HostElf);
    }
}
