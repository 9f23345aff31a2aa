/// Bytecode disassembler (luac -l style output).
use crate::opcode::{index_k, is_k, Instruction, InstructionFormat, OpCode};
use crate::proto::{Constant, Proto};
use lunac_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a complete Proto into a human-readable string.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, true);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner, is_main: bool) {
    let source = proto
        .source
        .map(|id| String::from_utf8_lossy(strings.get_bytes(id)).into_owned())
        .unwrap_or_else(|| "?".to_string());
    let what = if is_main { "main" } else { "function" };
    let vararg = if proto.is_vararg != 0 { "+" } else { "" };
    writeln!(
        out,
        "{what} <{source}:{},{}> ({} instructions)",
        proto.line_defined,
        proto.last_line_defined,
        proto.code.len()
    )
    .unwrap();
    writeln!(
        out,
        "{}{vararg} params, {} slots, {} upvalues, {} locals, {} constants, {} functions",
        proto.num_params,
        proto.max_stack_size,
        proto.upvalue_names.len(),
        proto.local_vars.len(),
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.line_info.get(pc).copied().unwrap_or(0);
        write!(out, "\t{}\t[{}]\t", pc + 1, line).unwrap();
        disasm_instruction(out, inst, pc, proto, strings);
        writeln!(out).unwrap();
    }

    if !proto.constants.is_empty() {
        writeln!(out, "constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "\t{}\t", i + 1).unwrap();
            format_constant(out, k, strings);
            writeln!(out).unwrap();
        }
    }

    if !proto.local_vars.is_empty() {
        writeln!(out, "locals ({}):", proto.local_vars.len()).unwrap();
        for (i, var) in proto.local_vars.iter().enumerate() {
            writeln!(
                out,
                "\t{}\t{}\t{}\t{}",
                i,
                String::from_utf8_lossy(strings.get_bytes(var.name)),
                var.start_pc + 1,
                var.end_pc + 1
            )
            .unwrap();
        }
    }

    if !proto.upvalue_names.is_empty() {
        writeln!(out, "upvalues ({}):", proto.upvalue_names.len()).unwrap();
        for (i, name) in proto.upvalue_names.iter().enumerate() {
            writeln!(
                out,
                "\t{}\t{}",
                i,
                String::from_utf8_lossy(strings.get_bytes(*name))
            )
            .unwrap();
        }
    }

    for child in &proto.protos {
        writeln!(out).unwrap();
        disassemble_proto(out, child, strings, false);
    }
}

/// An RK operand prints as a register, or as the negative constant index
/// the reference lister uses.
fn rk_operand(rk: u32) -> i64 {
    if is_k(rk) {
        -1 - index_k(rk) as i64
    } else {
        rk as i64
    }
}

fn disasm_instruction(
    out: &mut String,
    inst: &Instruction,
    pc: usize,
    proto: &Proto,
    strings: &StringInterner,
) {
    let op = inst.opcode();
    write!(out, "{:<9}\t", op.name()).unwrap();

    match op.format() {
        InstructionFormat::IABC => {
            let b = if op.b_is_rk() {
                rk_operand(inst.b())
            } else {
                inst.b() as i64
            };
            let c = if op.c_is_rk() {
                rk_operand(inst.c())
            } else {
                inst.c() as i64
            };
            write!(out, "{} {} {}", inst.a(), b, c).unwrap();
            let mut comments = Vec::new();
            if op.b_is_rk() && is_k(inst.b()) {
                comments.push(constant_text(proto, index_k(inst.b()), strings));
            }
            if op.c_is_rk() && is_k(inst.c()) {
                comments.push(constant_text(proto, index_k(inst.c()), strings));
            }
            if !comments.is_empty() {
                write!(out, "\t; {}", comments.join(" ")).unwrap();
            }
        }
        InstructionFormat::IABx => {
            match op {
                OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal => {
                    write!(out, "{} {}", inst.a(), -1 - inst.bx() as i64).unwrap();
                    write!(
                        out,
                        "\t; {}",
                        constant_text(proto, inst.bx(), strings)
                    )
                    .unwrap();
                }
                _ => {
                    write!(out, "{} {}", inst.a(), inst.bx()).unwrap();
                }
            }
        }
        InstructionFormat::IAsBx => {
            write!(out, "{} {}", inst.a(), inst.sbx()).unwrap();
            write!(out, "\t; to {}", pc as i64 + 2 + inst.sbx() as i64).unwrap();
        }
    }
}

fn constant_text(proto: &Proto, index: u32, strings: &StringInterner) -> String {
    let mut s = String::new();
    match proto.constants.get(index as usize) {
        Some(k) => format_constant(&mut s, k, strings),
        None => s.push('?'),
    }
    s
}

fn format_constant(out: &mut String, k: &Constant, strings: &StringInterner) {
    match k {
        Constant::Nil => write!(out, "nil").unwrap(),
        Constant::Boolean(b) => write!(out, "{b}").unwrap(),
        Constant::Number(n) => write!(out, "{n}").unwrap(),
        Constant::String(id) => {
            let bytes = strings.get_bytes(*id);
            if let Ok(s) = std::str::from_utf8(bytes) {
                write!(out, "\"{s}\"").unwrap();
            } else {
                write!(out, "<binary string>").unwrap();
            }
        }
    }
}
