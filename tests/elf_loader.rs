// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Loads hand-assembled x86-64 relocatable objects through the Host-Compute program path.
#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::path::PathBuf;
use std::sync::Arc;

use floor::universal_binary::{BinaryEntry, BinaryFormat, Target, host_elf_machine};
use floor::{
    ArgAccess, ArgInfo, Buffer, Context, ContextConfig, ExecutionParams, Function, FunctionInfo, HostContext,
    MemoryFlags, MemoryObject, Program, ProgramSource, Queue, UniversalBinary,
};

const EM_X86_64: u16 = 62;
const R_X86_64_64: u64 = 1;
const R_X86_64_PC32: u64 = 2;
const R_X86_64_PLT32: u64 = 4;
const R_X86_64_GOTPCREL: u64 = 9;

/// `void store_id(void **params) { ((uint32_t *)*(void **)params[0])[id] = id; }` with
/// `id = callee(0)`.
const STORE_ID: [u8; 21] = [
    0x53, // push rbx
    0x48, 0x8b, 0x07, // mov rax, [rdi]
    0x48, 0x8b, 0x18, // mov rbx, [rax]
    0x31, 0xff, // xor edi, edi
    0xe8, 0x00, 0x00, 0x00, 0x00, // call callee
    0x89, 0xc1, // mov ecx, eax
    0x89, 0x04, 0x8b, // mov [rbx + rcx * 4], eax
    0x5b, // pop rbx
    0xc3, // ret
];
const CALL_DISPLACEMENT: u64 = 10;

fn pad(out: &mut Vec<u8>, align: usize) {
    out.resize(out.len().next_multiple_of(align), 0);
}

fn strings(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut table = vec![0u8];
    let mut offsets = Vec::new();
    for name in names {
        offsets.push(table.len() as u32);
        table.extend_from_slice(name.as_bytes());
        table.push(0);
    }
    (table, offsets)
}

struct SectionHeader {
    name: u32,
    kind: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entry_size: u64,
}

const TEXT_SECTION: u16 = 1;
const DATA_SECTION: u16 = 2;

/// A symbol table entry; an index of 0 marks it undefined.
struct ObjectSymbol<'a> {
    name: &'a str,
    info: u8,
    section: u16,
    value: u64,
    size: u64,
}

impl<'a> ObjectSymbol<'a> {
    fn function(name: &'a str, size: usize) -> Self {
        ObjectSymbol { name, info: 0x12, section: TEXT_SECTION, value: 0, size: size as u64 }
    }

    fn object(name: &'a str, value: u64, size: u64) -> Self {
        ObjectSymbol { name, info: 0x11, section: DATA_SECTION, value, size }
    }

    fn undefined(name: &'a str) -> Self {
        ObjectSymbol { name, info: 0x10, section: 0, value: 0, size: 0 }
    }
}

/// A `.rela.text` entry; `symbol` is 1-based as in the symbol table.
struct TextRelocation {
    offset: u64,
    symbol: u64,
    kind: u64,
    addend: i64,
}

/// A relocatable object with one `.text` and one `.data` section.
fn assemble(
    machine: u16,
    text: &[u8],
    data: &[u8],
    symbols: &[ObjectSymbol<'_>],
    relocations: &[TextRelocation],
) -> Vec<u8> {
    let names: Vec<&str> = symbols.iter().map(|s| s.name).collect();
    let (symbol_names, symbol_offsets) = strings(&names);
    let (section_names, section_offsets) =
        strings(&[".text", ".data", ".rela.text", ".symtab", ".strtab", ".shstrtab"]);

    let mut out = vec![0u8; 64];
    let text_at = out.len();
    out.extend_from_slice(text);
    pad(&mut out, 8);
    let data_at = out.len();
    out.extend_from_slice(data);
    pad(&mut out, 8);

    let rela = out.len();
    for relocation in relocations {
        out.extend_from_slice(&relocation.offset.to_le_bytes());
        out.extend_from_slice(&((relocation.symbol << 32) | relocation.kind).to_le_bytes());
        out.extend_from_slice(&relocation.addend.to_le_bytes());
    }

    let symtab = out.len();
    out.extend_from_slice(&[0u8; 24]);
    for (symbol, name) in symbols.iter().zip(&symbol_offsets) {
        out.extend_from_slice(&name.to_le_bytes());
        out.extend_from_slice(&[symbol.info, 0]);
        out.extend_from_slice(&symbol.section.to_le_bytes());
        out.extend_from_slice(&symbol.value.to_le_bytes());
        out.extend_from_slice(&symbol.size.to_le_bytes());
    }

    let strtab = out.len();
    out.extend_from_slice(&symbol_names);
    let shstrtab = out.len();
    out.extend_from_slice(&section_names);
    pad(&mut out, 8);

    let headers = [
        SectionHeader { name: 0, kind: 0, flags: 0, offset: 0, size: 0, link: 0, info: 0, align: 0, entry_size: 0 },
        SectionHeader {
            name: section_offsets[0],
            kind: 1,
            flags: 0x6,
            offset: text_at as u64,
            size: text.len() as u64,
            link: 0,
            info: 0,
            align: 16,
            entry_size: 0,
        },
        SectionHeader {
            name: section_offsets[1],
            kind: 1,
            flags: 0x3,
            offset: data_at as u64,
            size: data.len() as u64,
            link: 0,
            info: 0,
            align: 8,
            entry_size: 0,
        },
        SectionHeader {
            name: section_offsets[2],
            kind: 4,
            flags: 0,
            offset: rela as u64,
            size: (relocations.len() * 24) as u64,
            link: 4,
            info: TEXT_SECTION as u32,
            align: 8,
            entry_size: 24,
        },
        SectionHeader {
            name: section_offsets[3],
            kind: 2,
            flags: 0,
            offset: symtab as u64,
            size: ((symbols.len() + 1) * 24) as u64,
            link: 5,
            info: 1,
            align: 8,
            entry_size: 24,
        },
        SectionHeader {
            name: section_offsets[4],
            kind: 3,
            flags: 0,
            offset: strtab as u64,
            size: symbol_names.len() as u64,
            link: 0,
            info: 0,
            align: 1,
            entry_size: 0,
        },
        SectionHeader {
            name: section_offsets[5],
            kind: 3,
            flags: 0,
            offset: shstrtab as u64,
            size: section_names.len() as u64,
            link: 0,
            info: 0,
            align: 1,
            entry_size: 0,
        },
    ];
    let section_table = out.len();
    for header in &headers {
        out.extend_from_slice(&header.name.to_le_bytes());
        out.extend_from_slice(&header.kind.to_le_bytes());
        out.extend_from_slice(&header.flags.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&header.offset.to_le_bytes());
        out.extend_from_slice(&header.size.to_le_bytes());
        out.extend_from_slice(&header.link.to_le_bytes());
        out.extend_from_slice(&header.info.to_le_bytes());
        out.extend_from_slice(&header.align.to_le_bytes());
        out.extend_from_slice(&header.entry_size.to_le_bytes());
    }

    out[..4].copy_from_slice(b"\x7fELF");
    out[4] = 2;
    out[5] = 1;
    out[6] = 1;
    out[16..18].copy_from_slice(&1u16.to_le_bytes());
    out[18..20].copy_from_slice(&machine.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[40..48].copy_from_slice(&(section_table as u64).to_le_bytes());
    out[52..54].copy_from_slice(&64u16.to_le_bytes());
    out[58..60].copy_from_slice(&64u16.to_le_bytes());
    out[60..62].copy_from_slice(&(headers.len() as u16).to_le_bytes());
    out[62..64].copy_from_slice(&6u16.to_le_bytes());
    out
}

/// A relocatable object defining `store_id` and calling `callee`.
fn object(machine: u16, callee: &str) -> Vec<u8> {
    assemble(
        machine,
        &STORE_ID,
        &[],
        &[ObjectSymbol::function("store_id", STORE_ID.len()), ObjectSymbol::undefined(callee)],
        &[TextRelocation {
            offset: CALL_DISPLACEMENT,
            symbol: 2,
            kind: R_X86_64_PLT32,
            addend: -4,
        }],
    )
}

/// `relocated(void **params)` writes, for `id = floor_host_compute_global_id_get(0)`:
/// `out[id] = id` calling through a GOT slot, `out[32 + id] = id` calling through an absolute
/// address, and `out[64 + id] = MARKER` loaded PC-relative from `.data`.
const RELOCATED: [u8; 61] = [
    0x53, // push rbx
    0x48, 0x8b, 0x07, // mov rax, [rdi]
    0x48, 0x8b, 0x18, // mov rbx, [rax]
    0x31, 0xff, // xor edi, edi
    0x48, 0x8b, 0x05, 0x00, 0x00, 0x00, 0x00, // mov rax, [rip + callee@GOTPCREL]
    0xff, 0xd0, // call rax
    0x89, 0xc1, // mov ecx, eax
    0x89, 0x04, 0x8b, // mov [rbx + rcx * 4], eax
    0x31, 0xff, // xor edi, edi
    0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, // movabs rax, callee
    0xff, 0xd0, // call rax
    0x89, 0xc1, // mov ecx, eax
    0x89, 0x84, 0x8b, 0x80, 0x00, 0x00, 0x00, // mov [rbx + rcx * 4 + 128], eax
    0x8b, 0x05, 0x00, 0x00, 0x00, 0x00, // mov eax, [rip + marker]
    0x89, 0x84, 0x8b, 0x00, 0x01, 0x00, 0x00, // mov [rbx + rcx * 4 + 256], eax
    0x5b, // pop rbx
    0xc3, // ret
];
const MARKER: u32 = 0x00c0_ffee;

fn relocated_object() -> Vec<u8> {
    assemble(
        EM_X86_64,
        &RELOCATED,
        &MARKER.to_le_bytes(),
        &[
            ObjectSymbol::function("relocated", RELOCATED.len()),
            ObjectSymbol::undefined("floor_host_compute_global_id_get"),
            ObjectSymbol::object("marker", 0, 4),
        ],
        &[
            TextRelocation { offset: 12, symbol: 2, kind: R_X86_64_GOTPCREL, addend: -4 },
            TextRelocation { offset: 27, symbol: 2, kind: R_X86_64_64, addend: 0 },
            TextRelocation { offset: 48, symbol: 3, kind: R_X86_64_PC32, addend: -4 },
        ],
    )
}

fn store_id_info() -> FunctionInfo {
    FunctionInfo::kernel("store_id", vec![ArgInfo::buffer(ArgAccess::Write)])
}

fn host() -> (HostContext, Arc<dyn Queue>) {
    let context = HostContext::new(ContextConfig::host());
    let device = context.fastest_device().expect("host device").clone();
    let queue = context.create_queue(&device).unwrap();
    (context, queue)
}

fn write_object(name: &str, bytes: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("floor-{name}-{}.o", std::process::id()));
    std::fs::write(&path, bytes).unwrap();
    path
}

fn run_store_id(context: &HostContext, queue: &dyn Queue, program: &dyn Program) -> Vec<u32> {
    let out = context
        .create_buffer(queue, 32 * 4, MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ)
        .unwrap();
    let function = program.function("store_id").unwrap();
    function
        .execute(queue, ExecutionParams::linear(32, 0).arg(&out).blocking())
        .unwrap();
    let mut bytes = vec![0u8; out.size()];
    out.read_into(queue, &mut bytes, 0).unwrap();
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

#[test]
fn loads_and_links_an_object_file() {
    let (context, queue) = host();
    let path = write_object("linked", &object(EM_X86_64, "floor_host_compute_global_id_get"));
    let program = context
        .create_program(ProgramSource::Module {
            path: path.clone(),
            functions: vec![store_id_info()],
        })
        .unwrap();
    let _ = std::fs::remove_file(&path);
    assert_eq!(program.function_names(), vec!["store_id".to_string()]);
    assert_eq!(run_store_id(&context, queue.as_ref(), program.as_ref()), (0..32).collect::<Vec<u32>>());
}

#[test]
fn loads_from_a_universal_binary() {
    let (context, queue) = host();
    let entry = |machine: u32| BinaryEntry {
        target: Target {
            format: BinaryFormat::HostElf,
            variant: machine,
        },
        code: object(EM_X86_64, "floor_host_compute_global_id_get"),
        functions: vec![Arc::new(store_id_info())],
        has_arg_info: true,
    };
    let binary = UniversalBinary {
        version: 2,
        // the foreign-machine entry must be skipped
        entries: vec![entry(183), entry(host_elf_machine())],
    };
    let parsed = UniversalBinary::parse(&binary.to_bytes()).unwrap();
    assert_eq!(parsed.entries.len(), 2);
    let program = context
        .create_program(ProgramSource::UniversalBinary(Arc::new(parsed)))
        .unwrap();
    let ids = run_store_id(&context, queue.as_ref(), program.as_ref());
    assert_eq!(ids[31], 31);
}

#[test]
fn link_errors_surface_at_program_creation() {
    let (context, _queue) = host();
    let path = write_object("unresolved", &object(EM_X86_64, "floor_host_compute_no_such_symbol"));
    let result = context.create_program(ProgramSource::Module {
        path: path.clone(),
        functions: vec![store_id_info()],
    });
    let _ = std::fs::remove_file(&path);
    assert!(result.is_err());
}

#[test]
fn foreign_objects_are_rejected() {
    let (context, _queue) = host();
    let path = write_object("aarch64", &object(183, "floor_host_compute_global_id_get"));
    let result = context.create_program(ProgramSource::Module {
        path: path.clone(),
        functions: vec![store_id_info()],
    });
    let _ = std::fs::remove_file(&path);
    assert!(result.is_err());

    let missing = context.create_program(ProgramSource::Module {
        path: std::env::temp_dir().join("floor-does-not-exist.o"),
        functions: Vec::new(),
    });
    assert!(missing.is_err());
}

#[test]
fn undeclared_functions_are_skipped() {
    let (context, _queue) = host();
    let path = write_object("skipped", &object(EM_X86_64, "floor_host_compute_global_id_get"));
    let program = context
        .create_program(ProgramSource::Module {
            path: path.clone(),
            functions: vec![store_id_info(), FunctionInfo::kernel("not_in_object", Vec::new())],
        })
        .unwrap();
    let _ = std::fs::remove_file(&path);
    assert!(program.function("store_id").is_some());
    assert!(program.function("not_in_object").is_none());
}

#[test]
fn absolute_pc_relative_and_got_relocations() {
    let (context, queue) = host();
    let path = write_object("relocated", &relocated_object());
    let program = context
        .create_program(ProgramSource::Module {
            path: path.clone(),
            functions: vec![FunctionInfo::kernel("relocated", vec![ArgInfo::buffer(ArgAccess::Write)])],
        })
        .unwrap();
    let _ = std::fs::remove_file(&path);

    let out = context
        .create_buffer(queue.as_ref(), 96 * 4, MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ)
        .unwrap();
    program
        .function("relocated")
        .unwrap()
        .execute(queue.as_ref(), ExecutionParams::linear(32, 0).arg(&out).blocking())
        .unwrap();
    let mut bytes = vec![0u8; out.size()];
    out.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    let ids: Vec<u32> = (0..32).collect();
    assert_eq!(&words[..32], &ids[..], "GOTPCREL");
    assert_eq!(&words[32..64], &ids[..], "R_X86_64_64");
    assert_eq!(&words[64..], &[MARKER; 32][..], "PC32");
}
