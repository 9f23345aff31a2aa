use super::helpers::*;
use lunac_compiler::codegen::CompileErrorKind;

#[test]
fn e2e_syntax_errors() {
    assert!(matches!(
        compile_str_err("local = 1").kind,
        CompileErrorKind::Syntax(_)
    ));
    assert!(matches!(
        compile_str_err("if x then").kind,
        CompileErrorKind::Syntax(_)
    ));
    assert!(matches!(
        compile_str_err("return 1 +").kind,
        CompileErrorKind::Syntax(_)
    ));
    assert!(matches!(
        compile_str_err("f(").kind,
        CompileErrorKind::Syntax(_)
    ));
}

#[test]
fn e2e_error_lines() {
    let err = compile_str_err("local ok = 1\nlocal bad = *");
    assert_eq!(err.line, 2);
    let err = compile_str_err("f()\ng()\nh(]");
    assert_eq!(err.line, 3);
}

#[test]
fn e2e_lexical_errors() {
    assert!(compile_str_err("return \"unfinished")
        .kind
        .message()
        .contains("unfinished string"));
    assert!(compile_str_err("return 12abc")
        .kind
        .message()
        .contains("malformed number"));
}

#[test]
fn e2e_break_outside_loop() {
    assert_eq!(
        compile_str_err("break").kind,
        CompileErrorKind::BreakOutsideLoop
    );
    assert_eq!(
        compile_str_err("if x then break end").kind,
        CompileErrorKind::BreakOutsideLoop
    );
}

#[test]
fn e2e_break_inside_function_inside_loop() {
    // the function body is a fresh frame: the outer loop is not visible
    let err = compile_str_err("while true do local f = function() break end end");
    assert_eq!(err.kind, CompileErrorKind::BreakOutsideLoop);
}

#[test]
fn e2e_vararg_outside_vararg_function() {
    assert_eq!(
        compile_str_err("function f() return ... end").kind,
        CompileErrorKind::VarargOutsideFunction
    );
}

#[test]
fn e2e_too_many_locals() {
    let mut src = String::new();
    for i in 0..201 {
        src.push_str(&format!("local v{i} = {i}\n"));
    }
    assert_eq!(
        compile_str_err(&src).kind,
        CompileErrorKind::TooManyLocals
    );
}

#[test]
fn e2e_expression_too_complex() {
    // enough live temporaries to overflow the 250-register frame
    let mut src = String::from("return f(");
    src.push_str(&vec!["g()"; 260].join(", "));
    src.push(')');
    assert_eq!(
        compile_str_err(&src).kind,
        CompileErrorKind::ExpressionTooComplex
    );
}

#[test]
fn e2e_constant_overflow() {
    // one distinct number constant per statement, plus the name "a"
    let mut src = String::new();
    for i in 0..(1 << 18) {
        src.push_str(&format!("a = {i}.5\n"));
    }
    assert_eq!(
        compile_str_err(&src).kind,
        CompileErrorKind::ConstantOverflow
    );
}

#[test]
fn e2e_ambiguous_call_syntax() {
    let err = compile_str_err("f\n(1)");
    assert!(err.kind.message().contains("ambiguous syntax"));
    // same line is fine
    compile_str("f(1)");
}

#[test]
fn e2e_nesting_long_strings_rejected() {
    let err = compile_str_err("return [[a [[b]] c]]");
    assert!(err.kind.message().contains("nesting"));
}

#[test]
fn e2e_error_display_includes_line() {
    let err = compile_str_err("local bad = *");
    let rendered = err.to_string();
    assert!(rendered.starts_with("1: "));
}
