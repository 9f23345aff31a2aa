//! Lua 5.1 binary chunk serialization.
//!
//! The layout follows the reference dumper exactly, so chunks load in a
//! stock 5.1 virtual machine and compare byte-for-byte against `luac -o`
//! output on the same platform parameters (little-endian, 4-byte int,
//! 8-byte size_t, 8-byte double).

use crate::proto::{Constant, Proto};
use lunac_core::string::{StringId, StringInterner};

const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";
const LUAC_VERSION: u8 = 0x51;
const LUAC_FORMAT: u8 = 0; // official format
const LUAC_ENDIANNESS: u8 = 1; // little endian
const SIZEOF_INT: u8 = 4;
const SIZEOF_SIZE_T: u8 = 8;
const SIZEOF_INSTRUCTION: u8 = 4;
const SIZEOF_NUMBER: u8 = 8;
const NUMBER_IS_INTEGRAL: u8 = 0;

// Lua value type tags used for constants.
const LUA_TNIL: u8 = 0;
const LUA_TBOOLEAN: u8 = 1;
const LUA_TNUMBER: u8 = 3;
const LUA_TSTRING: u8 = 4;

/// Serialize a compiled chunk. With `strip`, debug information (source
/// name, line info, locals, upvalue names) is omitted.
pub fn dump(proto: &Proto, strings: &StringInterner, strip: bool) -> Vec<u8> {
    let mut out = Vec::new();
    write_header(&mut out);
    write_function(&mut out, proto, strings, strip, None);
    out
}

fn write_header(out: &mut Vec<u8>) {
    out.extend_from_slice(LUA_SIGNATURE);
    out.push(LUAC_VERSION);
    out.push(LUAC_FORMAT);
    out.push(LUAC_ENDIANNESS);
    out.push(SIZEOF_INT);
    out.push(SIZEOF_SIZE_T);
    out.push(SIZEOF_INSTRUCTION);
    out.push(SIZEOF_NUMBER);
    out.push(NUMBER_IS_INTEGRAL);
}

fn write_int(out: &mut Vec<u8>, n: u32) {
    out.extend_from_slice(&n.to_le_bytes());
}

fn write_size(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(&(n as u64).to_le_bytes());
}

/// Strings carry their length including a trailing NUL; an absent string
/// is written as size zero with no bytes.
fn write_string(out: &mut Vec<u8>, s: Option<&[u8]>) {
    match s {
        None => write_size(out, 0),
        Some(bytes) => {
            write_size(out, bytes.len() + 1);
            out.extend_from_slice(bytes);
            out.push(0);
        }
    }
}

fn write_function(
    out: &mut Vec<u8>,
    proto: &Proto,
    strings: &StringInterner,
    strip: bool,
    parent_source: Option<StringId>,
) {
    // source name: omitted when stripped or equal to the parent's
    if strip || proto.source == parent_source {
        write_string(out, None);
    } else {
        write_string(out, proto.source.map(|id| strings.get_bytes(id)));
    }
    write_int(out, proto.line_defined);
    write_int(out, proto.last_line_defined);
    out.push(proto.upvalue_names.len() as u8);
    out.push(proto.num_params);
    out.push(proto.is_vararg);
    out.push(proto.max_stack_size);

    // code
    write_int(out, proto.code.len() as u32);
    for inst in &proto.code {
        out.extend_from_slice(&inst.0.to_le_bytes());
    }

    // constants
    write_int(out, proto.constants.len() as u32);
    for k in &proto.constants {
        match k {
            Constant::Nil => out.push(LUA_TNIL),
            Constant::Boolean(b) => {
                out.push(LUA_TBOOLEAN);
                out.push(*b as u8);
            }
            Constant::Number(n) => {
                out.push(LUA_TNUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::String(id) => {
                out.push(LUA_TSTRING);
                write_string(out, Some(strings.get_bytes(*id)));
            }
        }
    }

    // nested prototypes
    write_int(out, proto.protos.len() as u32);
    for child in &proto.protos {
        write_function(out, child, strings, strip, proto.source);
    }

    // debug info
    if strip {
        write_int(out, 0); // line info
        write_int(out, 0); // locals
        write_int(out, 0); // upvalue names
    } else {
        write_int(out, proto.line_info.len() as u32);
        for line in &proto.line_info {
            write_int(out, *line);
        }
        write_int(out, proto.local_vars.len() as u32);
        for var in &proto.local_vars {
            write_string(out, Some(strings.get_bytes(var.name)));
            write_int(out, var.start_pc);
            write_int(out, var.end_pc);
        }
        write_int(out, proto.upvalue_names.len() as u32);
        for name in &proto.upvalue_names {
            write_string(out, Some(strings.get_bytes(*name)));
        }
    }
}
