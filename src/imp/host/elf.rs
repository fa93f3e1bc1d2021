// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! ELF64 relocatable-object parsing.
//!
//! Host-Compute binaries are little-endian `ET_REL` objects for the running machine.  Parsing
//! only reads; placing sections and applying relocations is the loader's job.

/// ELF identification magic.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_REL: u16 = 1;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_WRITE: u64 = 1;
pub const SHF_ALLOC: u64 = 2;
pub const SHF_EXECINSTR: u64 = 4;

pub const SHN_UNDEF: u16 = 0;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;

pub const STB_LOCAL: u8 = 0;

const HEADER_SIZE: usize = 64;
const SECTION_HEADER_SIZE: usize = 64;
const SYMBOL_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ElfError {
    #[error("truncated ELF: {0}")]
    Truncated(&'static str),
    #[error("not an ELF file")]
    BadMagic,
    #[error("only little-endian ELF64 is supported")]
    UnsupportedClass,
    #[error("ELF machine {found} does not match the host ({expected})")]
    WrongMachine { found: u16, expected: u16 },
    #[error("ELF type {0} is not a relocatable object")]
    NotRelocatable(u16),
    #[error("section index {0} is out of range")]
    BadSection(usize),
    #[error("string table offset {0} is out of range")]
    BadString(usize),
    #[error("undefined symbol \"{0}\"")]
    UndefinedSymbol(String),
    #[error("relocation type {kind} is not supported on machine {machine}")]
    UnsupportedRelocation { kind: u32, machine: u16 },
    #[error("relocation type {kind} against \"{symbol}\" is out of range")]
    RelocationOutOfRange { kind: u32, symbol: String },
    #[error("function \"{0}\" is not defined by the object")]
    MissingFunction(String),
    #[error("memory mapping failed: {0}")]
    Map(String),
}

/// The ELF machine number of the running host.
pub fn host_machine() -> u16 {
    if cfg!(target_arch = "aarch64") {
        EM_AARCH64
    } else {
        EM_X86_64
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub kind: u32,
    pub flags: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub align: u64,
}

impl Section {
    pub fn is_alloc(&self) -> bool {
        self.flags & SHF_ALLOC != 0
    }
    pub fn is_exec(&self) -> bool {
        self.flags & SHF_EXECINSTR != 0
    }
    pub fn is_write(&self) -> bool {
        self.flags & SHF_WRITE != 0
    }
    pub fn is_nobits(&self) -> bool {
        self.kind == SHT_NOBITS
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub section: u16,
    pub binding: u8,
    pub kind: u8,
}

impl Symbol {
    pub fn is_undefined(&self) -> bool {
        self.section == SHN_UNDEF
    }
    pub fn is_local(&self) -> bool {
        self.binding == STB_LOCAL
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rela {
    pub offset: u64,
    pub symbol: u32,
    pub kind: u32,
    pub addend: i64,
}

/// The relocations applying to one section.
#[derive(Debug, Clone)]
pub struct RelocationSection {
    pub target: usize,
    pub entries: Vec<Rela>,
}

/// A parsed relocatable object.
#[derive(Debug, Clone)]
pub struct ElfObject {
    pub machine: u16,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub relocations: Vec<RelocationSection>,
}

struct Bytes<'a>(&'a [u8]);

impl Bytes<'_> {
    fn slice(&self, offset: usize, len: usize, what: &'static str) -> Result<&[u8], ElfError> {
        offset
            .checked_add(len)
            .and_then(|end| self.0.get(offset..end))
            .ok_or(ElfError::Truncated(what))
    }
    fn u16(&self, offset: usize, what: &'static str) -> Result<u16, ElfError> {
        let b = self.slice(offset, 2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
    fn u32(&self, offset: usize, what: &'static str) -> Result<u32, ElfError> {
        let b = self.slice(offset, 4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn u64(&self, offset: usize, what: &'static str) -> Result<u64, ElfError> {
        let b = self.slice(offset, 8, what)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(u64::from_le_bytes(word))
    }
}

fn contents<'a>(data: &'a [u8], section: &Section) -> Result<&'a [u8], ElfError> {
    if section.is_nobits() {
        return Ok(&[]);
    }
    let offset = section.offset as usize;
    offset
        .checked_add(section.size as usize)
        .and_then(|end| data.get(offset..end))
        .ok_or(ElfError::Truncated("section contents"))
}

fn string_at(table: &[u8], offset: usize) -> Result<String, ElfError> {
    let tail = table.get(offset..).ok_or(ElfError::BadString(offset))?;
    let end = tail.iter().position(|b| *b == 0).ok_or(ElfError::BadString(offset))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

impl ElfObject {
    /// Parses `data`, which must be an object for `machine`.
    pub fn parse(data: &[u8], machine: u16) -> Result<ElfObject, ElfError> {
        let bytes = Bytes(data);
        let ident = bytes.slice(0, 16, "identification")?;
        if ident[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if ident[4] != ELFCLASS64 || ident[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedClass);
        }
        bytes.slice(0, HEADER_SIZE, "header")?;
        let object_type = bytes.u16(16, "header")?;
        let found = bytes.u16(18, "header")?;
        if found != machine {
            return Err(ElfError::WrongMachine {
                found,
                expected: machine,
            });
        }
        if object_type != ET_REL {
            return Err(ElfError::NotRelocatable(object_type));
        }

        let section_offset = bytes.u64(40, "header")? as usize;
        let section_entry_size = bytes.u16(58, "header")? as usize;
        let section_count = bytes.u16(60, "header")? as usize;
        let names_index = bytes.u16(62, "header")? as usize;
        if section_count != 0 && section_entry_size < SECTION_HEADER_SIZE {
            return Err(ElfError::Truncated("section header"));
        }

        let mut raw = Vec::with_capacity(section_count);
        for index in 0..section_count {
            let at = section_offset + index * section_entry_size;
            bytes.slice(at, SECTION_HEADER_SIZE, "section header")?;
            raw.push((
                bytes.u32(at, "section header")? as usize,
                Section {
                    name: String::new(),
                    kind: bytes.u32(at + 4, "section header")?,
                    flags: bytes.u64(at + 8, "section header")?,
                    offset: bytes.u64(at + 24, "section header")?,
                    size: bytes.u64(at + 32, "section header")?,
                    link: bytes.u32(at + 40, "section header")?,
                    info: bytes.u32(at + 44, "section header")?,
                    align: bytes.u64(at + 48, "section header")?,
                },
            ));
        }

        let mut sections = Vec::with_capacity(raw.len());
        if section_count > 0 {
            let names = raw
                .get(names_index)
                .ok_or(ElfError::BadSection(names_index))
                .and_then(|(_, s)| contents(data, s))?;
            for (name_offset, mut section) in raw {
                section.name = string_at(names, name_offset)?;
                sections.push(section);
            }
        }

        let mut symbols = Vec::new();
        if let Some(symtab) = sections.iter().find(|s| s.kind == SHT_SYMTAB) {
            let strings = sections
                .get(symtab.link as usize)
                .ok_or(ElfError::BadSection(symtab.link as usize))
                .and_then(|s| contents(data, s))?;
            let table = contents(data, symtab)?;
            for entry in table.chunks_exact(SYMBOL_SIZE) {
                let entry = Bytes(entry);
                let info = entry.slice(4, 1, "symbol")?[0];
                symbols.push(Symbol {
                    name: string_at(strings, entry.u32(0, "symbol")? as usize)?,
                    binding: info >> 4,
                    kind: info & 0xf,
                    section: entry.u16(6, "symbol")?,
                    value: entry.u64(8, "symbol")?,
                    size: entry.u64(16, "symbol")?,
                });
            }
        }

        let mut relocations = Vec::new();
        for section in sections.iter().filter(|s| s.kind == SHT_RELA) {
            let target = section.info as usize;
            if target >= sections.len() {
                return Err(ElfError::BadSection(target));
            }
            let mut entries = Vec::new();
            for entry in contents(data, section)?.chunks_exact(RELA_SIZE) {
                let entry = Bytes(entry);
                let info = entry.u64(8, "relocation")?;
                let symbol = (info >> 32) as u32;
                if symbol as usize >= symbols.len().max(1) {
                    return Err(ElfError::Truncated("relocation symbol index"));
                }
                entries.push(Rela {
                    offset: entry.u64(0, "relocation")?,
                    symbol,
                    kind: info as u32,
                    addend: entry.u64(16, "relocation")? as i64,
                });
            }
            relocations.push(RelocationSection { target, entries });
        }

        Ok(ElfObject {
            machine,
            sections,
            symbols,
            relocations,
        })
    }

    /// The file bytes of section `index` (empty for `SHT_NOBITS`).
    pub fn section_data<'a>(&self, data: &'a [u8], index: usize) -> Result<&'a [u8], ElfError> {
        let section = self.sections.get(index).ok_or(ElfError::BadSection(index))?;
        contents(data, section)
    }

    /// Global symbols defined in an allocated section, by name.
    pub fn defined_symbols(&self) -> impl Iterator<Item = (usize, &Symbol)> {
        self.symbols.iter().enumerate().filter(|(_, s)| {
            !s.is_local()
                && !s.is_undefined()
                && !s.name.is_empty()
                && s.section != SHN_COMMON
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(machine: u16, object_type: u16) -> Vec<u8> {
        let mut h = vec![0u8; HEADER_SIZE];
        h[..4].copy_from_slice(&ELF_MAGIC);
        h[4] = ELFCLASS64;
        h[5] = ELFDATA2LSB;
        h[6] = 1;
        h[16..18].copy_from_slice(&object_type.to_le_bytes());
        h[18..20].copy_from_slice(&machine.to_le_bytes());
        h[52..54].copy_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        h[58..60].copy_from_slice(&(SECTION_HEADER_SIZE as u16).to_le_bytes());
        h
    }

    #[test]
    fn header_validation() {
        assert!(matches!(
            ElfObject::parse(b"\x7fELF", EM_X86_64),
            Err(ElfError::Truncated(_))
        ));
        assert!(matches!(
            ElfObject::parse(&[0u8; 64], EM_X86_64),
            Err(ElfError::BadMagic)
        ));
        let mut big_endian = header(EM_X86_64, ET_REL);
        big_endian[5] = 2;
        assert!(matches!(
            ElfObject::parse(&big_endian, EM_X86_64),
            Err(ElfError::UnsupportedClass)
        ));
        assert!(matches!(
            ElfObject::parse(&header(EM_AARCH64, ET_REL), EM_X86_64),
            Err(ElfError::WrongMachine {
                found: EM_AARCH64,
                expected: EM_X86_64
            })
        ));
        assert!(matches!(
            ElfObject::parse(&header(EM_X86_64, 3), EM_X86_64),
            Err(ElfError::NotRelocatable(3))
        ));
        let empty = ElfObject::parse(&header(EM_X86_64, ET_REL), EM_X86_64).unwrap();
        assert!(empty.sections.is_empty());
        assert!(empty.symbols.is_empty());
    }

    #[test]
    fn strings() {
        let table = b"\0.text\0sym\0";
        assert_eq!(string_at(table, 1).unwrap(), ".text");
        assert_eq!(string_at(table, 7).unwrap(), "sym");
        assert_eq!(string_at(table, 0).unwrap(), "");
        assert!(string_at(table, 40).is_err());
        assert!(string_at(b"abc", 0).is_err());
    }
}
