use super::helpers::*;
use lunac_compiler::opcode::{is_k, OpCode};
use lunac_compiler::proto::Constant;

#[test]
fn e2e_return_literals() {
    let (proto, _) = compile_str("return nil");
    assert!(has_opcode(&proto, OpCode::LoadNil));
    let (proto, _) = compile_str("return true");
    assert!(has_opcode(&proto, OpCode::LoadBool));
    let (proto, _) = compile_str("return 3.14");
    assert!(has_opcode(&proto, OpCode::LoadK));
}

#[test]
fn e2e_string_constant_roundtrip() {
    let (proto, strings) = compile_str("return \"hello world\"");
    assert_eq!(get_string_constant(&proto, 0, &strings), "hello world");
}

#[test]
fn e2e_constants_deduplicated() {
    let (proto, _) = compile_str("local a, b, c = 7, 7, 7");
    assert_eq!(proto.constants, vec![Constant::Number(7.0)]);
}

#[test]
fn e2e_constants_first_use_order() {
    let (proto, strings) = compile_str("local a = 'x' local b = 5 local c = 'x'");
    assert_eq!(proto.constants.len(), 2);
    assert_eq!(get_string_constant(&proto, 0, &strings), "x");
    assert_eq!(get_number_constant(&proto, 1), 5.0);
}

#[test]
fn e2e_arith_uses_rk_constants() {
    let (proto, _) = compile_str("local x return x + 1");
    let add = proto.code.iter().find(|i| i.opcode() == OpCode::Add).unwrap();
    assert!(!is_k(add.b()));
    assert!(is_k(add.c()));
}

#[test]
fn e2e_folding_produces_single_constant() {
    let (proto, _) = compile_str("return 1 + 2");
    assert_eq!(proto.constants, vec![Constant::Number(3.0)]);
    assert!(!has_opcode(&proto, OpCode::Add));
}

#[test]
fn e2e_folding_skips_division_by_zero() {
    let (proto, _) = compile_str("return 1/0");
    assert!(has_opcode(&proto, OpCode::Div));
    assert_eq!(proto.constants.len(), 2);
}

#[test]
fn e2e_folding_skips_modulo_by_zero() {
    let (proto, _) = compile_str("return 1 % 0");
    assert!(has_opcode(&proto, OpCode::Mod));
}

#[test]
fn e2e_unary_minus_folds() {
    let (proto, _) = compile_str("return -7");
    assert_eq!(proto.constants, vec![Constant::Number(-7.0)]);
    assert!(!has_opcode(&proto, OpCode::Unm));
}

#[test]
fn e2e_unary_minus_on_variable() {
    let (proto, _) = compile_str("local x return -x");
    assert!(has_opcode(&proto, OpCode::Unm));
}

#[test]
fn e2e_not_materializes_boolean() {
    let (proto, _) = compile_str("local x return not x");
    assert!(has_opcode(&proto, OpCode::Not));
}

#[test]
fn e2e_length_operator() {
    let (proto, _) = compile_str("local t return #t");
    assert!(has_opcode(&proto, OpCode::Len));
}

#[test]
fn e2e_concat_merges_chain() {
    let (proto, _) = compile_str("local a, b, c return a .. b .. c");
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
}

#[test]
fn e2e_comparison_emits_test_pair() {
    let (proto, _) = compile_str("local a, b return a == b");
    assert!(has_opcode(&proto, OpCode::Eq));
    assert!(has_opcode(&proto, OpCode::Jmp));
    assert_eq!(count_opcode(&proto, OpCode::LoadBool), 2);
}

#[test]
fn e2e_comparison_constant_operands() {
    let (proto, _) = compile_str("local x return x == 1");
    let eq = proto.code.iter().find(|i| i.opcode() == OpCode::Eq).unwrap();
    assert!(is_k(eq.c()));
}

#[test]
fn e2e_and_or_short_circuit() {
    let (proto, _) = compile_str("local a, b return a and b or 'default'");
    assert!(has_opcode(&proto, OpCode::Test) || has_opcode(&proto, OpCode::TestSet));
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_condition_inside_if_needs_no_value() {
    let (proto, _) = compile_str("local a, b if a and b then f() end");
    // pure control flow: no boolean materialization
    assert!(!has_opcode(&proto, OpCode::LoadBool));
}

#[test]
fn e2e_index_chain() {
    let (proto, _) = compile_str("return a.b.c[1]");
    assert_eq!(count_opcode(&proto, OpCode::GetTable), 3);
}

#[test]
fn e2e_call_results_single_in_expression() {
    let (proto, _) = compile_str("local x = f() + 1");
    let call = proto.code.iter().find(|i| i.opcode() == OpCode::Call).unwrap();
    assert_eq!(call.c(), 2); // exactly one result
}

#[test]
fn e2e_vararg_expression() {
    let (proto, _) = compile_str("return ...");
    assert!(has_opcode(&proto, OpCode::VarArg));
    // open vararg return: count unknown
    let ret = proto.code[proto.code.len() - 2];
    assert_eq!(ret.b(), 0);
}

#[test]
fn e2e_paren_closes_vararg() {
    let (proto, _) = compile_str("return (...)");
    let va = proto.code.iter().find(|i| i.opcode() == OpCode::VarArg).unwrap();
    assert_eq!(va.b(), 2); // exactly one value
}

#[test]
fn e2e_table_constructor_array_hint() {
    let (proto, _) = compile_str("return {1, 2, 3, 4}");
    let nt = proto.code[0];
    assert_eq!(nt.opcode(), OpCode::NewTable);
    assert_eq!(nt.b(), 4);
    assert!(has_opcode(&proto, OpCode::SetList));
}

#[test]
fn e2e_table_constructor_keyed_fields() {
    let (proto, _) = compile_str("return {x = 1, [2] = 3}");
    assert_eq!(count_opcode(&proto, OpCode::SetTable), 2);
    assert!(!has_opcode(&proto, OpCode::SetList));
}

#[test]
fn e2e_big_constructor_batches() {
    let items = (1..=120).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
    let (proto, _) = compile_str(&format!("return {{{items}}}"));
    assert_eq!(count_opcode(&proto, OpCode::SetList), 3);
}

#[test]
fn e2e_nested_constructor() {
    let (proto, _) = compile_str("return {a = {1}, {b = 2}}");
    assert_eq!(count_opcode(&proto, OpCode::NewTable), 3);
}

#[test]
fn e2e_power_right_associative() {
    // 2 ^ 3 ^ 2 = 2 ^ 9 = 512, folded
    let (proto, _) = compile_str("return 2 ^ 3 ^ 2");
    assert_eq!(proto.constants, vec![Constant::Number(512.0)]);
}

#[test]
fn e2e_modulo_floor_semantics() {
    let (proto, _) = compile_str("return -5 % 3");
    // unary minus binds tighter than %, then the fold applies floor rules
    assert_eq!(proto.constants, vec![Constant::Number(1.0)]);
}
