//! Whole-program compilations exercising the generator end to end.
use super::helpers::*;
use lunac_compiler::opcode::OpCode;
use lunac_compiler::proto::Proto;

/// Walk a proto tree checking the structural invariants every compiled
/// function must satisfy.
fn check_invariants(proto: &Proto) {
    assert!(proto.max_stack_size >= 2);
    assert!((proto.max_stack_size as usize) <= 250);
    assert_eq!(proto.code.len(), proto.line_info.len());
    // the final instruction is the implicit return
    let last = proto.code[proto.code.len() - 1];
    assert_eq!(last.opcode(), OpCode::Return);
    assert_eq!((last.a(), last.b()), (0, 1));
    for var in &proto.local_vars {
        assert!(var.start_pc <= var.end_pc);
        assert!((var.end_pc as usize) <= proto.code.len());
    }
    // lifetimes of successive locals nest or follow, never cross
    for pair in proto.local_vars.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(b.start_pc >= a.start_pc);
        assert!(b.end_pc <= a.end_pc || b.start_pc >= a.end_pc);
    }
    for child in &proto.protos {
        check_invariants(child);
    }
}

#[test]
fn e2e_fibonacci() {
    let (proto, _) = compile_str(
        "local function fib(n)\n\
           if n < 2 then\n\
             return n\n\
           end\n\
           return fib(n - 1) + fib(n - 2)\n\
         end\n\
         return fib(10)",
    );
    check_invariants(&proto);
    let fib = &proto.protos[0];
    assert!(has_opcode(fib, OpCode::Lt));
    assert!(has_opcode(fib, OpCode::Add));
    assert!(has_opcode(fib, OpCode::GetUpval));
    assert!(has_opcode(&proto, OpCode::TailCall));
}

#[test]
fn e2e_sieve() {
    let (proto, _) = compile_str(
        "local function sieve(n)\n\
           local is_prime = {}\n\
           for i = 2, n do\n\
             is_prime[i] = true\n\
           end\n\
           for i = 2, n do\n\
             if is_prime[i] then\n\
               for j = i * i, n, i do\n\
                 is_prime[j] = false\n\
               end\n\
             end\n\
           end\n\
           local count = 0\n\
           for i = 2, n do\n\
             if is_prime[i] then\n\
               count = count + 1\n\
             end\n\
           end\n\
           return count\n\
         end\n\
         return sieve(100)",
    );
    check_invariants(&proto);
    let sieve = &proto.protos[0];
    assert_eq!(count_opcode(sieve, OpCode::ForPrep), 4);
    assert!(has_opcode(sieve, OpCode::NewTable));
    assert!(has_opcode(sieve, OpCode::SetTable));
}

#[test]
fn e2e_string_buffer() {
    let (proto, _) = compile_str(
        "local buffer = {}\n\
         local n = 0\n\
         local function emit(piece)\n\
           n = n + 1\n\
           buffer[n] = piece\n\
         end\n\
         emit('head')\n\
         emit('tail')\n\
         return table.concat(buffer, '\\n')",
    );
    check_invariants(&proto);
    let emit = &proto.protos[0];
    assert_eq!(emit.upvalue_names.len(), 2);
    assert!(has_opcode(emit, OpCode::SetUpval));
}

#[test]
fn e2e_counter_object() {
    let (proto, _) = compile_str(
        "local function new_counter()\n\
           local value = 0\n\
           return {\n\
             bump = function() value = value + 1 return value end,\n\
             read = function() return value end,\n\
           }\n\
         end\n\
         local c = new_counter()\n\
         c.bump()\n\
         return c.read()",
    );
    check_invariants(&proto);
    let ctor = &proto.protos[0];
    assert_eq!(ctor.protos.len(), 2);
    assert!(ctor.protos.iter().all(|p| !p.upvalue_names.is_empty()));
}

#[test]
fn e2e_event_dispatch_table() {
    let (proto, _) = compile_str(
        "local handlers = {}\n\
         function handlers.open(path) return io.open(path) end\n\
         function handlers.close(fh) fh:close() end\n\
         local function dispatch(name, ...)\n\
           local h = handlers[name]\n\
           if h then\n\
             return h(...)\n\
           end\n\
           return nil, 'no handler: ' .. name\n\
         end\n\
         return dispatch('open', 'test.txt')",
    );
    check_invariants(&proto);
    assert!(count_opcode(&proto, OpCode::Closure) >= 1);
}

#[test]
fn e2e_deeply_nested_blocks() {
    let (proto, _) = compile_str(
        "local total = 0\n\
         for i = 1, 3 do\n\
           for j = 1, 3 do\n\
             if i == j then\n\
               while total < 100 do\n\
                 total = total + i * j\n\
                 if total % 7 == 0 then break end\n\
               end\n\
             end\n\
           end\n\
         end\n\
         return total",
    );
    check_invariants(&proto);
    assert_eq!(count_opcode(&proto, OpCode::ForLoop), 2);
}

#[test]
fn e2e_multiple_returns_and_selects() {
    let (proto, _) = compile_str(
        "local function three() return 1, 2, 3 end\n\
         local a, b, c = three()\n\
         local t = {three()}\n\
         local first = (three())\n\
         return a + b + c + first, t",
    );
    check_invariants(&proto);
}

#[test]
fn e2e_varargs_forwarding() {
    let (proto, _) = compile_str(
        "local function pack(...)\n\
           return {n = select('#', ...), ...}\n\
         end\n\
         return pack(1, nil, 3)",
    );
    check_invariants(&proto);
}
