// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Loads Host-Compute ELF objects into executable memory.

Every instance is one private mapping laid out as three page-aligned regions:

| region | contents | final protection |
|---|---|---|
| text | executable sections, then one far-call stub per undefined symbol | read + execute |
| rodata | read-only allocated sections | read |
| data | writable sections, `.bss`, common symbols, the GOT and the ID block | read + write |

Keeping everything in one mapping keeps PC-relative and GOT-relative references within reach.
Relocations are applied while the whole mapping is still writable.
*/

use std::collections::HashMap;
use std::sync::Arc;

use super::elf::{ElfError, ElfObject, EM_AARCH64, EM_X86_64, SHN_ABS, SHN_COMMON, host_machine};
use super::exec_memory::{ExecMemory, Protection, page_size};
use super::externs::{ExternTable, ID_BLOCK_SYMBOL};

/// Entry point ABI of a Host-Compute function: one pointer per parameter.
pub(crate) type KernelFn = unsafe extern "C" fn(*const *const u8);

const STB_WEAK: u8 = 2;
const GOT_ENTRY_SIZE: usize = 8;
const STUB_SIZE: usize = 16;

/// Launch geometry visible to loaded code through [ID_BLOCK_SYMBOL].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdBlock {
    pub global_size: [u32; 3],
    pub local_size: [u32; 3],
    pub group_count: [u32; 3],
    pub work_dim: u32,
}

/// A parsed object, ready to be instantiated any number of times.
#[derive(Debug)]
pub(crate) struct ElfImage {
    data: Arc<[u8]>,
    object: ElfObject,
}

impl ElfImage {
    pub(crate) fn parse(data: impl Into<Arc<[u8]>>) -> Result<ElfImage, ElfError> {
        let data = data.into();
        let object = ElfObject::parse(&data, host_machine())?;
        Ok(ElfImage { data, object })
    }

    pub(crate) fn defines(&self, name: &str) -> bool {
        self.object.defined_symbols().any(|(_, s)| s.name == name)
    }

    /// Maps, relocates and protects a fresh copy of the object.
    pub(crate) fn instantiate(&self, externs: &ExternTable) -> Result<ElfInstance, ElfError> {
        let object = &self.object;
        let page = page_size();

        let mut base = vec![None::<usize>; object.sections.len()];
        let mut place_region = |region: Region, mut cursor: usize| {
            for (index, section) in object.sections.iter().enumerate() {
                if section.is_alloc() && Region::of(section.is_exec(), section.is_write()) == region {
                    cursor = cursor.next_multiple_of(section.align.max(1) as usize);
                    base[index] = Some(cursor);
                    cursor += section.size as usize;
                }
            }
            cursor
        };

        let mut cursor = place_region(Region::Text, 0).next_multiple_of(STUB_SIZE);
        // undefined symbols each get a far-call stub at the end of the text region
        let undefined: Vec<usize> = object
            .symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_undefined() && !s.name.is_empty())
            .map(|(i, _)| i)
            .collect();
        let stubs_start = cursor;
        let mut stub_of = HashMap::new();
        for (n, symbol) in undefined.iter().enumerate() {
            stub_of.insert(*symbol, stubs_start + n * STUB_SIZE);
        }
        cursor += undefined.len() * STUB_SIZE;
        let text_end = cursor;

        let rodata_start = cursor.next_multiple_of(page);
        let rodata_end = place_region(Region::Rodata, rodata_start);
        cursor = place_region(Region::Data, rodata_end.next_multiple_of(page));
        let mut common_of = HashMap::new();
        for (index, symbol) in object.symbols.iter().enumerate() {
            if symbol.section == SHN_COMMON {
                // for common symbols the value is the alignment
                cursor = cursor.next_multiple_of(symbol.value.max(1) as usize);
                common_of.insert(index, cursor);
                cursor += symbol.size as usize;
            }
        }
        cursor = cursor.next_multiple_of(GOT_ENTRY_SIZE);
        let mut got_of = HashMap::new();
        for relocation in object.relocations.iter().flat_map(|r| r.entries.iter()) {
            if uses_got(object.machine, relocation.kind) && !got_of.contains_key(&(relocation.symbol as usize)) {
                got_of.insert(relocation.symbol as usize, cursor);
                cursor += GOT_ENTRY_SIZE;
            }
        }
        cursor = cursor.next_multiple_of(16);
        let id_block = cursor;
        cursor += std::mem::size_of::<IdBlock>();
        let total = cursor.max(1);

        let mut memory = ExecMemory::new(total)?;
        let origin = memory.as_ptr() as u64;
        // SAFETY: the mapping is fresh, writable and not yet executable
        let bytes = unsafe { memory.as_mut_slice() };

        for (index, section) in object.sections.iter().enumerate() {
            if let Some(at) = base[index]
                && !section.is_nobits()
            {
                let contents = object.section_data(&self.data, index)?;
                bytes[at..at + contents.len()].copy_from_slice(contents);
            }
        }

        let address_of = |index: usize| -> Result<u64, ElfError> {
            let symbol = &object.symbols[index];
            if symbol.is_undefined() {
                if symbol.name.is_empty() {
                    return Ok(0);
                }
                if symbol.name == ID_BLOCK_SYMBOL {
                    return Ok(origin + id_block as u64);
                }
                return match externs.address(&symbol.name) {
                    Some(address) => Ok(address as u64),
                    None if symbol.binding == STB_WEAK => Ok(0),
                    None => Err(ElfError::UndefinedSymbol(symbol.name.clone())),
                };
            }
            match symbol.section {
                SHN_ABS => Ok(symbol.value),
                SHN_COMMON => common_of
                    .get(&index)
                    .map(|at| origin + *at as u64)
                    .ok_or(ElfError::BadSection(SHN_COMMON as usize)),
                section => base
                    .get(section as usize)
                    .copied()
                    .flatten()
                    .map(|at| origin + at as u64 + symbol.value)
                    .ok_or(ElfError::BadSection(section as usize)),
            }
        };

        for (symbol, at) in &stub_of {
            let target = address_of(*symbol)?;
            write_stub(object.machine, &mut bytes[*at..*at + STUB_SIZE], target);
        }
        for (symbol, at) in &got_of {
            let target = address_of(*symbol)?;
            bytes[*at..*at + GOT_ENTRY_SIZE].copy_from_slice(&target.to_le_bytes());
        }

        for section in &object.relocations {
            let Some(section_base) = base[section.target] else {
                // relocations of debug info and other unloaded sections
                continue;
            };
            for relocation in &section.entries {
                let index = relocation.symbol as usize;
                let at = section_base + relocation.offset as usize;
                let target = Target {
                    symbol: address_of(index)?,
                    got: got_of.get(&index).map(|g| origin + *g as u64),
                    stub: stub_of.get(&index).map(|s| origin + *s as u64),
                };
                let place = bytes.get_mut(at..).ok_or(ElfError::Truncated("relocation offset"))?;
                apply(object.machine, relocation.kind, place, origin + at as u64, &target, relocation.addend)
                    .map_err(|fault| fault.into_error(relocation.kind, object.machine, &object.symbols[index].name))?;
            }
        }

        let mut symbols = HashMap::new();
        for (index, symbol) in object.defined_symbols() {
            symbols.insert(symbol.name.clone(), address_of(index)?);
        }

        if text_end > 0 {
            memory.protect_range(0..text_end, Protection::ReadExecute)?;
        }
        if rodata_end > rodata_start {
            memory.protect_range(rodata_start..rodata_end, Protection::ReadOnly)?;
        }
        flush_instruction_cache(origin as *const u8, text_end);

        Ok(ElfInstance {
            memory,
            symbols,
            id_block,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Text,
    Rodata,
    Data,
}

impl Region {
    fn of(exec: bool, write: bool) -> Region {
        if exec {
            Region::Text
        } else if write {
            Region::Data
        } else {
            Region::Rodata
        }
    }
}

/// One loaded copy of an object, with its own data, GOT and ID block.
#[derive(Debug)]
pub(crate) struct ElfInstance {
    memory: ExecMemory,
    symbols: HashMap<String, u64>,
    id_block: usize,
}

impl ElfInstance {
    pub(crate) fn symbol_address(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub(crate) fn function(&self, name: &str) -> Result<KernelFn, ElfError> {
        let address = self
            .symbol_address(name)
            .ok_or_else(|| ElfError::MissingFunction(name.to_string()))?;
        // SAFETY: the symbol is defined in this instance's text, which stays mapped while
        // self lives; callers must not call it afterwards
        Ok(unsafe { std::mem::transmute::<usize, KernelFn>(address as usize) })
    }

    /// Rewrites the launch geometry seen by the loaded code.
    pub(crate) fn reset(&mut self, global_size: [u32; 3], local_size: [u32; 3], group_count: [u32; 3], work_dim: u32) {
        let block = IdBlock {
            global_size,
            local_size,
            group_count,
            work_dim,
        };
        // SAFETY: the ID block lies in the data region, which stays writable
        unsafe {
            std::ptr::write(self.memory.as_ptr().add(self.id_block).cast::<IdBlock>(), block);
        }
    }

    pub(crate) fn id_block(&self) -> IdBlock {
        // SAFETY: see reset
        unsafe { std::ptr::read(self.memory.as_ptr().add(self.id_block).cast::<IdBlock>()) }
    }
}

/// Addresses a relocation may refer to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target {
    pub symbol: u64,
    pub got: Option<u64>,
    pub stub: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Unsupported,
    OutOfRange,
    Truncated,
}

impl Fault {
    fn into_error(self, kind: u32, machine: u16, symbol: &str) -> ElfError {
        match self {
            Fault::Unsupported => ElfError::UnsupportedRelocation { kind, machine },
            Fault::OutOfRange => ElfError::RelocationOutOfRange {
                kind,
                symbol: symbol.to_string(),
            },
            Fault::Truncated => ElfError::Truncated("relocation target"),
        }
    }
}

mod x86_64 {
    pub const NONE: u32 = 0;
    pub const ABS64: u32 = 1;
    pub const PC32: u32 = 2;
    pub const PLT32: u32 = 4;
    pub const GOTPCREL: u32 = 9;
    pub const ABS32: u32 = 10;
    pub const ABS32S: u32 = 11;
    pub const PC64: u32 = 24;
    pub const GOTPCRELX: u32 = 41;
    pub const REX_GOTPCRELX: u32 = 42;
}

mod aarch64 {
    pub const NONE: u32 = 0;
    pub const NONE_LEGACY: u32 = 256;
    pub const ABS64: u32 = 257;
    pub const ABS32: u32 = 258;
    pub const PREL64: u32 = 260;
    pub const PREL32: u32 = 261;
    pub const ADR_PREL_PG_HI21: u32 = 275;
    pub const ADD_ABS_LO12_NC: u32 = 277;
    pub const LDST8_ABS_LO12_NC: u32 = 278;
    pub const JUMP26: u32 = 282;
    pub const CALL26: u32 = 283;
    pub const LDST16_ABS_LO12_NC: u32 = 284;
    pub const LDST32_ABS_LO12_NC: u32 = 285;
    pub const LDST64_ABS_LO12_NC: u32 = 286;
    pub const LDST128_ABS_LO12_NC: u32 = 299;
    pub const ADR_GOT_PAGE: u32 = 311;
    pub const LD64_GOT_LO12_NC: u32 = 312;
}

fn uses_got(machine: u16, kind: u32) -> bool {
    match machine {
        EM_X86_64 => matches!(kind, x86_64::GOTPCREL | x86_64::GOTPCRELX | x86_64::REX_GOTPCRELX),
        EM_AARCH64 => matches!(kind, aarch64::ADR_GOT_PAGE | aarch64::LD64_GOT_LO12_NC),
        _ => false,
    }
}

fn write_stub(machine: u16, stub: &mut [u8], target: u64) {
    match machine {
        EM_AARCH64 => {
            // ldr x16, #8 ; br x16 ; .quad target
            stub[0..4].copy_from_slice(&0x5800_0050u32.to_le_bytes());
            stub[4..8].copy_from_slice(&0xd61f_0200u32.to_le_bytes());
            stub[8..16].copy_from_slice(&target.to_le_bytes());
        }
        _ => {
            // jmp qword ptr [rip + 0] ; .quad target
            stub[0..6].copy_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
            stub[6..14].copy_from_slice(&target.to_le_bytes());
            stub[14..16].copy_from_slice(&[0xcc, 0xcc]);
        }
    }
}

fn put<const N: usize>(place: &mut [u8], bytes: [u8; N]) -> Result<(), Fault> {
    place
        .get_mut(..N)
        .ok_or(Fault::Truncated)?
        .copy_from_slice(&bytes);
    Ok(())
}

fn get_u32(place: &[u8]) -> Result<u32, Fault> {
    let b = place.get(..4).ok_or(Fault::Truncated)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn signed32(value: i64) -> Result<i32, Fault> {
    i32::try_from(value).map_err(|_| Fault::OutOfRange)
}

/// Patches one relocation at `place` (whose run-time address is `p`).
pub(crate) fn apply(machine: u16, kind: u32, place: &mut [u8], p: u64, target: &Target, addend: i64) -> Result<(), Fault> {
    match machine {
        EM_X86_64 => apply_x86_64(kind, place, p, target, addend),
        EM_AARCH64 => apply_aarch64(kind, place, p, target, addend),
        _ => Err(Fault::Unsupported),
    }
}

fn apply_x86_64(kind: u32, place: &mut [u8], p: u64, target: &Target, addend: i64) -> Result<(), Fault> {
    let s = target.symbol as i64;
    let p = p as i64;
    match kind {
        x86_64::NONE => Ok(()),
        x86_64::ABS64 => put(place, s.wrapping_add(addend).to_le_bytes()),
        x86_64::PC32 => put(place, signed32(s + addend - p)?.to_le_bytes()),
        x86_64::PLT32 => {
            let direct = signed32(s + addend - p);
            match (direct, target.stub) {
                (Ok(value), _) => put(place, value.to_le_bytes()),
                (Err(_), Some(stub)) => put(place, signed32(stub as i64 + addend - p)?.to_le_bytes()),
                (Err(fault), None) => Err(fault),
            }
        }
        x86_64::GOTPCREL | x86_64::GOTPCRELX | x86_64::REX_GOTPCRELX => {
            let got = target.got.ok_or(Fault::Unsupported)? as i64;
            put(place, signed32(got + addend - p)?.to_le_bytes())
        }
        x86_64::ABS32 => {
            let value = u32::try_from(s + addend).map_err(|_| Fault::OutOfRange)?;
            put(place, value.to_le_bytes())
        }
        x86_64::ABS32S => put(place, signed32(s + addend)?.to_le_bytes()),
        x86_64::PC64 => put(place, (s + addend - p).to_le_bytes()),
        _ => Err(Fault::Unsupported),
    }
}

fn page(address: i64) -> i64 {
    address & !0xfff
}

fn patch_insn(place: &mut [u8], mask: u32, bits: u32) -> Result<(), Fault> {
    let insn = get_u32(place)?;
    put(place, ((insn & !mask) | (bits & mask)).to_le_bytes())
}

fn adrp_bits(delta_pages: i64) -> Result<u32, Fault> {
    if !(-(1 << 20)..(1 << 20)).contains(&delta_pages) {
        return Err(Fault::OutOfRange);
    }
    let imm = delta_pages as u32;
    Ok(((imm & 0x3) << 29) | (((imm >> 2) & 0x7ffff) << 5))
}

fn apply_aarch64(kind: u32, place: &mut [u8], p: u64, target: &Target, addend: i64) -> Result<(), Fault> {
    let s = target.symbol as i64;
    let p = p as i64;
    const IMM12: u32 = 0xfff << 10;
    match kind {
        aarch64::NONE | aarch64::NONE_LEGACY => Ok(()),
        aarch64::ABS64 => put(place, s.wrapping_add(addend).to_le_bytes()),
        aarch64::ABS32 => {
            let value = u32::try_from(s + addend).map_err(|_| Fault::OutOfRange)?;
            put(place, value.to_le_bytes())
        }
        aarch64::PREL64 => put(place, (s + addend - p).to_le_bytes()),
        aarch64::PREL32 => put(place, signed32(s + addend - p)?.to_le_bytes()),
        aarch64::JUMP26 | aarch64::CALL26 => {
            let in_range = |offset: i64| (-(1 << 27)..(1 << 27)).contains(&offset) && offset % 4 == 0;
            let mut offset = s + addend - p;
            if !in_range(offset) {
                offset = target.stub.ok_or(Fault::OutOfRange)? as i64 + addend - p;
                if !in_range(offset) {
                    return Err(Fault::OutOfRange);
                }
            }
            patch_insn(place, 0x03ff_ffff, (offset >> 2) as u32)
        }
        aarch64::ADR_PREL_PG_HI21 => {
            let bits = adrp_bits((page(s + addend) - page(p)) >> 12)?;
            patch_insn(place, (0x3 << 29) | (0x7ffff << 5), bits)
        }
        aarch64::ADR_GOT_PAGE => {
            let got = target.got.ok_or(Fault::Unsupported)? as i64;
            let bits = adrp_bits((page(got) - page(p)) >> 12)?;
            patch_insn(place, (0x3 << 29) | (0x7ffff << 5), bits)
        }
        aarch64::ADD_ABS_LO12_NC => patch_insn(place, IMM12, (((s + addend) & 0xfff) as u32) << 10),
        aarch64::LDST8_ABS_LO12_NC
        | aarch64::LDST16_ABS_LO12_NC
        | aarch64::LDST32_ABS_LO12_NC
        | aarch64::LDST64_ABS_LO12_NC
        | aarch64::LDST128_ABS_LO12_NC => {
            let shift = match kind {
                aarch64::LDST8_ABS_LO12_NC => 0,
                aarch64::LDST16_ABS_LO12_NC => 1,
                aarch64::LDST32_ABS_LO12_NC => 2,
                aarch64::LDST64_ABS_LO12_NC => 3,
                _ => 4,
            };
            patch_insn(place, IMM12, ((((s + addend) & 0xfff) >> shift) as u32) << 10)
        }
        aarch64::LD64_GOT_LO12_NC => {
            let got = target.got.ok_or(Fault::Unsupported)? as i64;
            patch_insn(place, IMM12, (((got & 0xff8) >> 3) as u32) << 10)
        }
        _ => Err(Fault::Unsupported),
    }
}

fn flush_instruction_cache(start: *const u8, len: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        // data and instruction caches are not coherent on aarch64
        let line = 64usize;
        let begin = start as usize & !(line - 1);
        let end = start as usize + len;
        let mut at = begin;
        while at < end {
            // SAFETY: cache maintenance on our own mapping
            unsafe { std::arch::asm!("dc cvau, {0}", in(reg) at) };
            at += line;
        }
        // SAFETY: barrier instructions have no memory operands
        unsafe { std::arch::asm!("dsb ish") };
        let mut at = begin;
        while at < end {
            // SAFETY: as above
            unsafe { std::arch::asm!("ic ivau, {0}", in(reg) at) };
            at += line;
        }
        // SAFETY: as above
        unsafe { std::arch::asm!("dsb ish", "isb") };
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (start, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(symbol: u64) -> Target {
        Target {
            symbol,
            got: None,
            stub: None,
        }
    }

    #[test]
    fn x86_64_absolute_and_relative() {
        let mut place = [0u8; 8];
        apply(EM_X86_64, x86_64::ABS64, &mut place, 0x1000, &target(0x1234_5678_9abc), 4).unwrap();
        assert_eq!(u64::from_le_bytes(place), 0x1234_5678_9ac0);

        let mut place = [0u8; 4];
        apply(EM_X86_64, x86_64::PC32, &mut place, 0x1000, &target(0x2000), -4).unwrap();
        assert_eq!(i32::from_le_bytes(place), 0x2000 - 4 - 0x1000);
        apply(EM_X86_64, x86_64::PC32, &mut place, 0x3000, &target(0x2000), -4).unwrap();
        assert_eq!(i32::from_le_bytes(place), -0x1004);

        assert_eq!(
            apply(EM_X86_64, x86_64::PC32, &mut place, 0, &target(1 << 40), 0),
            Err(Fault::OutOfRange)
        );
    }

    #[test]
    fn x86_64_far_calls_use_the_stub() {
        let mut place = [0u8; 4];
        let far = Target {
            symbol: 1 << 40,
            got: None,
            stub: Some(0x5000),
        };
        apply(EM_X86_64, x86_64::PLT32, &mut place, 0x1000, &far, -4).unwrap();
        assert_eq!(i32::from_le_bytes(place), 0x5000 - 4 - 0x1000);
    }

    #[test]
    fn x86_64_got() {
        let mut place = [0u8; 4];
        let with_got = Target {
            symbol: 1 << 40,
            got: Some(0x8000),
            stub: None,
        };
        apply(EM_X86_64, x86_64::REX_GOTPCRELX, &mut place, 0x1003, &with_got, -4).unwrap();
        assert_eq!(i32::from_le_bytes(place), 0x8000 - 4 - 0x1003);
        assert_eq!(
            apply(EM_X86_64, x86_64::GOTPCREL, &mut place, 0, &target(0), 0),
            Err(Fault::Unsupported)
        );
        assert_eq!(apply(EM_X86_64, 37, &mut place, 0, &target(0), 0), Err(Fault::Unsupported));
        assert_eq!(
            apply(EM_X86_64, x86_64::ABS64, &mut place, 0, &target(0), 0),
            Err(Fault::Truncated)
        );
    }

    #[test]
    fn aarch64_branches_and_pages() {
        // bl #0
        let mut place = 0x9400_0000u32.to_le_bytes();
        apply(EM_AARCH64, aarch64::CALL26, &mut place, 0x1000, &target(0x1100), 0).unwrap();
        assert_eq!(u32::from_le_bytes(place), 0x9400_0000 | (0x100 >> 2));

        // adrp x0, #0
        let mut place = 0x9000_0000u32.to_le_bytes();
        apply(EM_AARCH64, aarch64::ADR_PREL_PG_HI21, &mut place, 0x1234, &target(0x5678), 0).unwrap();
        let insn = u32::from_le_bytes(place);
        let immlo = (insn >> 29) & 0x3;
        let immhi = (insn >> 5) & 0x7ffff;
        assert_eq!((immhi << 2) | immlo, 4);

        // ldr x0, [x0, #0]
        let mut place = 0xf940_0000u32.to_le_bytes();
        apply(EM_AARCH64, aarch64::LDST64_ABS_LO12_NC, &mut place, 0, &target(0x5678), 0).unwrap();
        assert_eq!((u32::from_le_bytes(place) >> 10) & 0xfff, 0x678 >> 3);

        let far = Target {
            symbol: 1 << 40,
            got: None,
            stub: None,
        };
        let mut place = 0x9400_0000u32.to_le_bytes();
        assert_eq!(
            apply(EM_AARCH64, aarch64::CALL26, &mut place, 0, &far, 0),
            Err(Fault::OutOfRange)
        );
    }

    #[test]
    fn stubs() {
        let mut stub = [0u8; STUB_SIZE];
        write_stub(EM_X86_64, &mut stub, 0x1122_3344_5566_7788);
        assert_eq!(&stub[..2], &[0xff, 0x25]);
        assert_eq!(u64::from_le_bytes(stub[6..14].try_into().unwrap()), 0x1122_3344_5566_7788);
        write_stub(EM_AARCH64, &mut stub, 42);
        assert_eq!(u64::from_le_bytes(stub[8..16].try_into().unwrap()), 42);
    }
}
