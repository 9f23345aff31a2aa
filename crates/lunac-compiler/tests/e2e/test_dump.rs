//! Binary chunk output checks: header, layout, and a hand-assembled
//! golden chunk.
use super::helpers::*;
use lunac_compiler::dump::dump;
use lunac_compiler::opcode::{Instruction, OpCode};

fn dump_str(source: &str, strip: bool) -> Vec<u8> {
    let (proto, strings) = compile_str(source);
    dump(&proto, &strings, strip)
}

/// The expected serialization of `local a = 1`, built field by field.
fn golden_local_a() -> Vec<u8> {
    let mut out = Vec::new();
    // header
    out.extend_from_slice(b"\x1bLua");
    out.extend_from_slice(&[0x51, 0, 1, 4, 8, 4, 8, 0]);
    // source name "@test.lua"
    out.extend_from_slice(&10u64.to_le_bytes());
    out.extend_from_slice(b"@test.lua\0");
    // linedefined, lastlinedefined
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    // nups, numparams, is_vararg, maxstacksize
    out.extend_from_slice(&[0, 0, 2, 2]);
    // code: LOADK 0 0; RETURN 0 1
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&Instruction::abx(OpCode::LoadK, 0, 0).0.to_le_bytes());
    out.extend_from_slice(&Instruction::abc(OpCode::Return, 0, 1, 0).0.to_le_bytes());
    // constants: the number 1
    out.extend_from_slice(&1u32.to_le_bytes());
    out.push(3); // LUA_TNUMBER
    out.extend_from_slice(&1.0f64.to_le_bytes());
    // no nested protos
    out.extend_from_slice(&0u32.to_le_bytes());
    // line info: both instructions on line 1
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    // locals: a, active from 1, dead at 2
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&2u64.to_le_bytes());
    out.extend_from_slice(b"a\0");
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    // no upvalues
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

#[test]
fn e2e_golden_chunk_bytes() {
    assert_eq!(dump_str("local a = 1", false), golden_local_a());
}

#[test]
fn e2e_header_is_stable() {
    let a = dump_str("", false);
    let b = dump_str("return 1", false);
    assert_eq!(&a[..12], &b[..12]);
    assert_eq!(&a[..5], b"\x1bLua\x51");
}

#[test]
fn e2e_deterministic_output() {
    let src = "local t = {1, 2, x = 3} return t";
    assert_eq!(dump_str(src, false), dump_str(src, false));
}

#[test]
fn e2e_strip_drops_names() {
    let src = "local long_variable_name = 1 return long_variable_name";
    let full = dump_str(src, false);
    let stripped = dump_str(src, true);
    assert!(stripped.len() < full.len());
    let needle = b"long_variable_name";
    assert!(full.windows(needle.len()).any(|w| w == needle));
    assert!(!stripped.windows(needle.len()).any(|w| w == needle));
}

#[test]
fn e2e_stripped_code_identical() {
    // stripping changes debug sections only; code bytes survive
    let src = "for i = 1, 10 do f(i) end";
    let (proto, strings) = compile_str(src);
    let full = dump(&proto, &strings, false);
    let stripped = dump(&proto, &strings, true);
    let code_bytes: Vec<u8> = proto
        .code
        .iter()
        .flat_map(|i| i.0.to_le_bytes())
        .collect();
    assert!(full
        .windows(code_bytes.len())
        .any(|w| w == &code_bytes[..]));
    assert!(stripped
        .windows(code_bytes.len())
        .any(|w| w == &code_bytes[..]));
}

#[test]
fn e2e_compile_to_chunk_matches_two_step() {
    let src = "local a = 1";
    let one_step =
        lunac_compiler::codegen::compile_to_chunk(src.as_bytes(), "@test.lua", false).unwrap();
    assert_eq!(one_step, dump_str(src, false));
}

#[test]
fn e2e_nested_functions_serialized_depth_first() {
    let bytes = dump_str(
        "function outer() local function inner() return 1 end return inner end",
        false,
    );
    // three RETURN-terminated code sections exist; sanity-check by length
    assert!(bytes.len() > 100);
}
