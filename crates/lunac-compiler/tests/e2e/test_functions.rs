use super::helpers::*;
use lunac_compiler::opcode::OpCode;
use lunac_compiler::proto::{VARARG_HASARG, VARARG_ISVARARG};

#[test]
fn e2e_function_statement() {
    let (proto, strings) = compile_str("function f() end");
    assert!(has_opcode(&proto, OpCode::Closure));
    assert!(has_opcode(&proto, OpCode::SetGlobal));
    assert_eq!(proto.protos.len(), 1);
    assert_eq!(get_string_constant(&proto, 0, &strings), "f");
}

#[test]
fn e2e_function_field_definition() {
    let (proto, _) = compile_str("function a.b.c() end");
    assert!(has_opcode(&proto, OpCode::GetTable));
    assert!(has_opcode(&proto, OpCode::SetTable));
}

#[test]
fn e2e_method_definition() {
    let (proto, strings) = compile_str("function t:m() return self end");
    let inner = &proto.protos[0];
    assert_eq!(inner.num_params, 1);
    assert_eq!(
        String::from_utf8_lossy(strings.get_bytes(inner.local_vars[0].name)),
        "self"
    );
}

#[test]
fn e2e_parameters_occupy_registers() {
    let (proto, _) = compile_str("function f(a, b, c) return b end");
    let inner = &proto.protos[0];
    assert_eq!(inner.num_params, 3);
    // return b: the local's home register is returned directly
    let ret = inner.code[0];
    assert_eq!(ret.opcode(), OpCode::Return);
    assert_eq!(ret.a(), 1);
}

#[test]
fn e2e_function_line_span() {
    let (proto, _) = compile_str("local f =\n  function()\n  end");
    let inner = &proto.protos[0];
    assert_eq!(inner.line_defined, 2);
    assert_eq!(inner.last_line_defined, 3);
}

#[test]
fn e2e_vararg_function_flags() {
    let (proto, _) = compile_str("function f(...) return ... end");
    let inner = &proto.protos[0];
    assert_eq!(inner.is_vararg & VARARG_ISVARARG, VARARG_ISVARARG);
    assert_eq!(inner.is_vararg & VARARG_HASARG, VARARG_HASARG);
    assert_eq!(inner.num_params, 0);
}

#[test]
fn e2e_fixed_function_rejects_vararg() {
    let err = compile_str_err("function f() return ... end");
    assert!(err.kind.message().contains("outside a vararg function"));
}

#[test]
fn e2e_main_chunk_accepts_vararg() {
    let (proto, _) = compile_str("local args = {...}");
    assert_eq!(proto.is_vararg, VARARG_ISVARARG);
    assert!(has_opcode(&proto, OpCode::VarArg));
}

#[test]
fn e2e_upvalue_read_and_write() {
    let (proto, strings) = compile_str(
        "local count = 0\n\
         function inc() count = count + 1 end\n\
         function get() return count end",
    );
    assert_eq!(proto.protos.len(), 2);
    let inc = &proto.protos[0];
    assert!(has_opcode(inc, OpCode::GetUpval));
    assert!(has_opcode(inc, OpCode::SetUpval));
    let get = &proto.protos[1];
    assert!(has_opcode(get, OpCode::GetUpval));
    assert_eq!(
        String::from_utf8_lossy(strings.get_bytes(get.upvalue_names[0])),
        "count"
    );
}

#[test]
fn e2e_upvalues_deduplicated() {
    let (proto, _) = compile_str("local x function f() return x + x end");
    assert_eq!(proto.protos[0].upvalue_names.len(), 1);
}

#[test]
fn e2e_closure_pseudo_instructions() {
    let (proto, _) = compile_str("local a, b function f() return a, b end");
    let closure_pc = proto
        .code
        .iter()
        .position(|i| i.opcode() == OpCode::Closure)
        .unwrap();
    // one MOVE per captured local follows the CLOSURE
    assert_eq!(proto.code[closure_pc + 1].opcode(), OpCode::Move);
    assert_eq!(proto.code[closure_pc + 2].opcode(), OpCode::Move);
    assert_eq!(proto.code[closure_pc + 1].b(), 0);
    assert_eq!(proto.code[closure_pc + 2].b(), 1);
}

#[test]
fn e2e_nested_closures_chain_upvalues() {
    let (proto, _) = compile_str(
        "local x\n\
         function outer()\n\
           return function() return x end\n\
         end",
    );
    let outer = &proto.protos[0];
    let inner = &outer.protos[0];
    assert_eq!(outer.upvalue_names.len(), 1);
    assert_eq!(inner.upvalue_names.len(), 1);
    let closure_pc = outer
        .code
        .iter()
        .position(|i| i.opcode() == OpCode::Closure)
        .unwrap();
    assert_eq!(outer.code[closure_pc + 1].opcode(), OpCode::GetUpval);
}

#[test]
fn e2e_local_function_recursion() {
    let (proto, _) = compile_str("local function f(n) return f(n) end");
    assert_eq!(proto.protos[0].upvalue_names.len(), 1);
}

#[test]
fn e2e_tail_call() {
    let (proto, _) = compile_str("function f() return g() end");
    let inner = &proto.protos[0];
    assert!(has_opcode(inner, OpCode::TailCall));
    assert!(!has_opcode(inner, OpCode::Call));
}

#[test]
fn e2e_no_tail_call_with_extra_values() {
    let (proto, _) = compile_str("function f() return g(), 1 end");
    let inner = &proto.protos[0];
    assert!(!has_opcode(inner, OpCode::TailCall));
}

#[test]
fn e2e_call_argument_forwarding() {
    let (proto, _) = compile_str("f(g())");
    // inner call kept open so all results forward
    let calls: Vec<_> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::Call)
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].c(), 0); // g(): all results
    assert_eq!(calls[1].b(), 0); // f(...): open argument count
}

#[test]
fn e2e_captured_block_local_closes() {
    let (proto, _) = compile_str(
        "for i = 1, 10 do\n\
           local x = i\n\
           store(function() return x end)\n\
         end",
    );
    assert!(has_opcode(&proto, OpCode::Close));
}

#[test]
fn e2e_break_with_captured_local_closes() {
    let (proto, _) = compile_str(
        "while true do\n\
           local x = 1\n\
           store(function() return x end)\n\
           break\n\
         end",
    );
    assert!(has_opcode(&proto, OpCode::Close));
}

#[test]
fn e2e_function_max_stack_at_least_two() {
    let (proto, _) = compile_str("function f() end");
    assert!(proto.protos[0].max_stack_size >= 2);
}
