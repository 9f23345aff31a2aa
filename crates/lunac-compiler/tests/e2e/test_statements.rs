use super::helpers::*;
use lunac_compiler::opcode::OpCode;

#[test]
fn e2e_empty_chunk() {
    let (proto, _) = compile_str("");
    assert_eq!(proto.code.len(), 1);
    assert_eq!(proto.code[0].opcode(), OpCode::Return);
}

#[test]
fn e2e_local_declaration() {
    let (proto, strings) = compile_str("local answer = 42");
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert_eq!(get_number_constant(&proto, 0), 42.0);
    assert_eq!(
        String::from_utf8_lossy(strings.get_bytes(proto.local_vars[0].name)),
        "answer"
    );
}

#[test]
fn e2e_local_without_initializer_at_start_emits_nothing() {
    let (proto, _) = compile_str("local a, b, c");
    // fresh registers are already nil at function entry
    assert!(!has_opcode(&proto, OpCode::LoadNil));
}

#[test]
fn e2e_local_without_initializer_mid_function() {
    let (proto, _) = compile_str("f()\nlocal a, b");
    assert!(has_opcode(&proto, OpCode::LoadNil));
}

#[test]
fn e2e_global_assignment() {
    let (proto, strings) = compile_str("answer = 42");
    assert!(has_opcode(&proto, OpCode::SetGlobal));
    assert_eq!(get_string_constant(&proto, 0, &strings), "answer");
}

#[test]
fn e2e_global_read() {
    let (proto, _) = compile_str("return x");
    assert!(has_opcode(&proto, OpCode::GetGlobal));
}

#[test]
fn e2e_field_assignment() {
    let (proto, _) = compile_str("t.x = 1");
    assert!(has_opcode(&proto, OpCode::SetTable));
}

#[test]
fn e2e_multiple_assignment_counts() {
    let (proto, _) = compile_str("local a, b, c = 1, 2");
    // two LOADKs and one LOADNIL fill
    assert_eq!(count_opcode(&proto, OpCode::LoadK), 2);
    assert!(has_opcode(&proto, OpCode::LoadNil));
}

#[test]
fn e2e_extra_values_discarded() {
    let (proto, _) = compile_str("local a = 1, 2, 3");
    assert_eq!(count_opcode(&proto, OpCode::LoadK), 3);
    assert_eq!(proto.max_stack_size >= 3, true);
}

#[test]
fn e2e_if_then() {
    let (proto, _) = compile_str("local y if y then y = 1 end");
    assert!(has_opcode(&proto, OpCode::Test));
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_if_elseif_else() {
    let (proto, _) = compile_str(
        "local x, y\nif x then y = 1 elseif y then y = 2 else y = 3 end",
    );
    assert_eq!(count_opcode(&proto, OpCode::Test), 2);
    assert!(count_opcode(&proto, OpCode::Jmp) >= 4);
}

#[test]
fn e2e_while_loop() {
    let (proto, _) = compile_str("local n = 0 while n < 10 do n = n + 1 end");
    assert!(has_opcode(&proto, OpCode::Lt));
    assert!(has_opcode(&proto, OpCode::Add));
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_repeat_loop() {
    let (proto, _) = compile_str("local n = 0 repeat n = n + 1 until n > 10");
    assert!(has_opcode(&proto, OpCode::Lt)); // '>' compiles to LT with swapped operands
    assert!(has_opcode(&proto, OpCode::Add));
}

#[test]
fn e2e_numeric_for() {
    let (proto, _) = compile_str("local sum = 0 for i = 1, 100 do sum = sum + i end");
    assert!(has_opcode(&proto, OpCode::ForPrep));
    assert!(has_opcode(&proto, OpCode::ForLoop));
    // hidden control variables plus the visible ones
    assert_eq!(proto.local_vars.len(), 5);
}

#[test]
fn e2e_generic_for() {
    let (proto, _) = compile_str("for k, v in next, t do f(k, v) end");
    assert!(has_opcode(&proto, OpCode::TForLoop));
    // iterator explist is adjusted to three values
    assert!(has_opcode(&proto, OpCode::LoadNil) || has_opcode(&proto, OpCode::GetGlobal));
}

#[test]
fn e2e_break() {
    let (proto, _) = compile_str("while true do break end");
    assert_eq!(count_opcode(&proto, OpCode::Jmp), 2);
}

#[test]
fn e2e_do_block_scopes_locals() {
    let (proto, _) = compile_str("do local hidden = 1 end local shown = 2");
    // both land in register 0
    assert_eq!(proto.max_stack_size, 2);
    assert_eq!(proto.local_vars.len(), 2);
}

#[test]
fn e2e_return_empty() {
    let (proto, _) = compile_str("return");
    // explicit plus implicit final return
    assert_eq!(count_opcode(&proto, OpCode::Return), 2);
    assert_eq!(proto.code[0].b(), 1);
}

#[test]
fn e2e_return_values() {
    let (proto, _) = compile_str("return 1, 2");
    let ret = proto.code[proto.code.len() - 2];
    assert_eq!(ret.opcode(), OpCode::Return);
    assert_eq!(ret.b(), 3);
}

#[test]
fn e2e_call_statement_discards_results() {
    let (proto, _) = compile_str("f(1)");
    let call = proto.code.iter().find(|i| i.opcode() == OpCode::Call).unwrap();
    assert_eq!(call.c(), 1);
}

#[test]
fn e2e_method_call_statement() {
    let (proto, _) = compile_str("obj:method(1)");
    assert!(has_opcode(&proto, OpCode::Self_));
    assert!(has_opcode(&proto, OpCode::Call));
}

#[test]
fn e2e_statement_boundary_resets_registers() {
    // each statement starts from the same register base
    let (proto, _) = compile_str("f(1, 2, 3)\ng(4, 5, 6)");
    let calls: Vec<_> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::Call)
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].a(), calls[1].a());
}
