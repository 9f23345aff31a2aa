use lunac_compiler::codegen::{compile, CompileError};
use lunac_compiler::opcode::OpCode;
use lunac_compiler::proto::{Constant, Proto};
use lunac_core::string::StringInterner;

/// Compile a Lua source string and return the Proto + StringInterner.
pub fn compile_str(source: &str) -> (Proto, StringInterner) {
    compile(source.as_bytes(), "@test.lua").unwrap_or_else(|e| {
        panic!("compile failed: {e}\nsource:\n{source}");
    })
}

/// Compile a Lua source string and expect an error.
pub fn compile_str_err(source: &str) -> CompileError {
    match compile(source.as_bytes(), "@test.lua") {
        Err(e) => e,
        Ok(_) => panic!("expected compile error, got success\nsource:\n{source}"),
    }
}

/// Check if a Proto contains a specific opcode.
pub fn has_opcode(proto: &Proto, op: OpCode) -> bool {
    proto.code.iter().any(|i| i.opcode() == op)
}

/// Count occurrences of an opcode in a Proto.
pub fn count_opcode(proto: &Proto, op: OpCode) -> usize {
    proto.code.iter().filter(|i| i.opcode() == op).count()
}

/// Get string constant value by index.
#[allow(dead_code)]
pub fn get_string_constant(proto: &Proto, idx: usize, strings: &StringInterner) -> String {
    match &proto.constants[idx] {
        Constant::String(id) => String::from_utf8(strings.get_bytes(*id).to_vec()).unwrap(),
        other => panic!("expected string constant, got {other:?}"),
    }
}

/// Get number constant value by index.
#[allow(dead_code)]
pub fn get_number_constant(proto: &Proto, idx: usize) -> f64 {
    match &proto.constants[idx] {
        Constant::Number(n) => *n,
        other => panic!("expected number constant, got {other:?}"),
    }
}
