//! The code generator: walks the AST and drives per-function `FuncState`s
//! to produce `Proto`s whose bytecode, constants, and debug records are
//! bit-identical to the reference compiler's.

pub mod expr;
pub mod func;

use crate::ast::{Block, Expr, FuncBody, Name, Stat, TableField};
use crate::opcode::{int2fb, OpCode, MAX_UPVALUES, MAX_VARS};
use crate::parser::parse_chunk;
use crate::proto::{Proto, VARARG_HASARG, VARARG_ISVARARG, VARARG_NEEDSARG};
use expr::{ExpDesc, ExpKind, UpvalDesc, NO_JUMP};
use func::{BlockCx, FuncState, MULTRET};
use lunac_core::string::{StringId, StringInterner};
use std::fmt;

/// What went wrong during compilation.
#[derive(Clone, Debug, PartialEq)]
pub enum CompileErrorKind {
    /// Lexical or grammatical error, with the renderable message.
    Syntax(String),
    ConstantOverflow,
    TooManyLocals,
    TooManyUpvalues,
    TooManyVariablesInAssignment,
    ExpressionTooComplex,
    ControlStructureTooLong,
    VarargOutsideFunction,
    BreakOutsideLoop,
}

impl CompileErrorKind {
    pub fn message(&self) -> String {
        match self {
            CompileErrorKind::Syntax(msg) => msg.clone(),
            CompileErrorKind::ConstantOverflow => "constant table overflow".into(),
            CompileErrorKind::TooManyLocals => "too many local variables".into(),
            CompileErrorKind::TooManyUpvalues => "too many upvalues".into(),
            CompileErrorKind::TooManyVariablesInAssignment => {
                "too many variables in assignment".into()
            }
            CompileErrorKind::ExpressionTooComplex => {
                "function or expression too complex".into()
            }
            CompileErrorKind::ControlStructureTooLong => "control structure too long".into(),
            CompileErrorKind::VarargOutsideFunction => {
                "cannot use '...' outside a vararg function".into()
            }
            CompileErrorKind::BreakOutsideLoop => "no loop to break".into(),
        }
    }
}

/// Compiler error: a structured kind plus the originating source line.
#[derive(Clone, Debug, PartialEq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.kind.message())
    }
}

impl std::error::Error for CompileError {}

/// Compile Lua source to a `Proto`. Public API entry point; `chunk_name`
/// becomes the source name in debug info (e.g. "@file.lua").
pub fn compile(
    source: &[u8],
    chunk_name: &str,
) -> Result<(Proto, StringInterner), CompileError> {
    let (block, mut strings) = parse_chunk(source).map_err(|e| CompileError {
        kind: CompileErrorKind::Syntax(e.message),
        line: e.line,
    })?;
    let source_id = strings.intern(chunk_name.as_bytes());

    let mut generator = Generator {
        func_stack: Vec::new(),
        strings,
    };
    let mut main = FuncState::new();
    main.proto.source = Some(source_id);
    main.proto.is_vararg = VARARG_ISVARARG; // the main chunk is always vararg
    main.line = 1;
    generator.func_stack.push(main);

    generator.statements(&block)?;
    let main = generator.close_func()?;
    debug_assert!(generator.func_stack.is_empty());
    debug_assert!(main.upvalues.is_empty());
    Ok((main.proto, generator.strings))
}

/// Compile and serialize in one step.
pub fn compile_to_chunk(
    source: &[u8],
    chunk_name: &str,
    strip: bool,
) -> Result<Vec<u8>, CompileError> {
    let (proto, strings) = compile(source, chunk_name)?;
    Ok(crate::dump::dump(&proto, &strings, strip))
}

struct Generator {
    /// Nested function frames; the innermost is last.
    func_stack: Vec<FuncState>,
    strings: StringInterner,
}

impl Generator {
    fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    fn error(&self, kind: CompileErrorKind) -> CompileError {
        CompileError {
            kind,
            line: self.fs().line,
        }
    }

    // ---- Blocks and scopes ----

    fn enter_block(&mut self, is_breakable: bool) {
        let fs = self.fs_mut();
        debug_assert!(fs.free_reg == fs.nactvar);
        fs.blocks.push(BlockCx {
            break_list: NO_JUMP,
            nactvar: fs.nactvar,
            upval: false,
            is_breakable,
        });
    }

    fn leave_block(&mut self) -> Result<(), CompileError> {
        let fs = self.fs_mut();
        let bl = fs.blocks.pop().expect("unbalanced block");
        fs.remove_vars(bl.nactvar);
        if bl.upval {
            fs.code_abc(OpCode::Close, bl.nactvar, 0, 0)?;
        }
        // a block either controls scope or breaks (never both)
        debug_assert!(!bl.is_breakable || !bl.upval);
        debug_assert!(bl.nactvar == fs.nactvar);
        fs.free_reg = fs.nactvar;
        fs.patch_to_here(bl.break_list)
    }

    /// A statement list inside its own scope.
    fn scoped_block(&mut self, block: &Block) -> Result<(), CompileError> {
        self.enter_block(false);
        self.statements(block)?;
        debug_assert!(self.fs().blocks.last().unwrap().break_list == NO_JUMP);
        self.leave_block()
    }

    fn statements(&mut self, block: &Block) -> Result<(), CompileError> {
        for stat in &block.stats {
            self.statement(stat)?;
            // every temporary dies at the statement boundary
            let fs = self.fs_mut();
            debug_assert!(fs.free_reg >= fs.nactvar);
            fs.free_reg = fs.nactvar;
        }
        Ok(())
    }

    /// Finish the innermost function: final return, then close the local
    /// debug records past it.
    fn close_func(&mut self) -> Result<FuncState, CompileError> {
        let fs = self.fs_mut();
        fs.ret(0, 0)?; // final return
        fs.remove_vars(0);
        Ok(self.func_stack.pop().unwrap())
    }

    // ---- Statements ----

    fn statement(&mut self, stat: &Stat) -> Result<(), CompileError> {
        match stat {
            Stat::Local { names, exprs, line } => self.local_stat(names, exprs, *line),
            Stat::LocalFunction { name, body } => self.local_function_stat(name, body),
            Stat::Assign {
                targets,
                exprs,
                line,
            } => self.assign_stat(targets, exprs, *line),
            Stat::Call { expr } => {
                let e = self.expr(expr)?;
                if let ExpKind::Call { pc } = e.kind {
                    // a call statement uses no results
                    self.fs_mut().proto.code[pc].set_c(1);
                }
                Ok(())
            }
            Stat::Do { body } => self.scoped_block(body),
            Stat::While { cond, body, line } => self.while_stat(cond, body, *line),
            Stat::Repeat { body, cond, line } => self.repeat_stat(body, cond, *line),
            Stat::If {
                arms,
                else_body,
                line,
            } => self.if_stat(arms, else_body.as_ref(), *line),
            Stat::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            } => self.numeric_for_stat(var, start, limit, step.as_ref(), body, *line),
            Stat::GenericFor {
                names,
                exprs,
                body,
                line,
            } => self.generic_for_stat(names, exprs, body, *line),
            Stat::Function { name, body } => self.function_stat(name, body),
            Stat::Return { exprs, line } => self.return_stat(exprs, *line),
            Stat::Break { line } => {
                self.fs_mut().line = *line;
                self.break_stat()
            }
        }
    }

    /// Generate an expression list: all but the last go to consecutive
    /// registers; the last is returned still open.
    fn exp_list(&mut self, exprs: &[Expr]) -> Result<(usize, ExpDesc), CompileError> {
        debug_assert!(!exprs.is_empty());
        let mut e = self.expr(&exprs[0])?;
        for next in &exprs[1..] {
            self.fs_mut().exp_to_next_reg(&mut e)?;
            e = self.expr(next)?;
        }
        Ok((exprs.len(), e))
    }

    /// Match value count to variable count: patch a trailing multi-ret to
    /// produce the difference, or pad with nils.
    fn adjust_assign(
        &mut self,
        nvars: usize,
        nexps: usize,
        e: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let mut extra = nvars as i32 - nexps as i32;
        if e.is_multi_ret() {
            extra += 1; // includes the call itself
            if extra < 0 {
                extra = 0;
            }
            self.fs_mut().set_returns(e, extra)?;
            if extra > 1 {
                self.fs_mut().reserve_regs(extra as u32 - 1)?;
            }
        } else {
            if !matches!(e.kind, ExpKind::Void) {
                self.fs_mut().exp_to_next_reg(e)?;
            }
            if extra > 0 {
                let fs = self.fs_mut();
                let reg = fs.free_reg;
                fs.reserve_regs(extra as u32)?;
                fs.load_nil(reg, extra as u32)?;
            }
        }
        Ok(())
    }

    fn local_stat(
        &mut self,
        names: &[Name],
        exprs: &[Expr],
        line: u32,
    ) -> Result<(), CompileError> {
        self.fs_mut().line = line;
        for name in names {
            self.fs_mut().new_local(name.id)?;
        }
        let (nexps, mut e) = if exprs.is_empty() {
            (0, ExpDesc::void())
        } else {
            self.exp_list(exprs)?
        };
        self.adjust_assign(names.len(), nexps, &mut e)?;
        self.fs_mut().adjust_local_vars(names.len() as u32);
        Ok(())
    }

    fn local_function_stat(&mut self, name: &Name, body: &FuncBody) -> Result<(), CompileError> {
        self.fs_mut().line = body.line;
        self.fs_mut().new_local(name.id)?;
        let reg = self.fs().free_reg;
        let v = ExpDesc::new(ExpKind::Local { register: reg });
        self.fs_mut().reserve_regs(1)?;
        self.fs_mut().adjust_local_vars(1);
        let mut b = self.push_function(body, false)?;
        self.fs_mut().store_var(&v, &mut b)?;
        // debug information only sees the variable after this point
        let fs = self.fs_mut();
        let idx = fs.actvar[(fs.nactvar - 1) as usize];
        let pc = fs.pc() as u32;
        fs.proto.local_vars[idx].start_pc = pc;
        Ok(())
    }

    fn assign_stat(
        &mut self,
        targets: &[Expr],
        exprs: &[Expr],
        line: u32,
    ) -> Result<(), CompileError> {
        self.fs_mut().line = line;
        if targets.len() > MAX_VARS {
            return Err(self.error(CompileErrorKind::TooManyVariablesInAssignment));
        }
        let mut lhs: Vec<ExpDesc> = Vec::with_capacity(targets.len());
        for target in targets {
            let v = self.expr(target)?;
            if !lhs.is_empty() {
                if let ExpKind::Local { .. } = v.kind {
                    self.check_conflict(&mut lhs, &v)?;
                }
            }
            lhs.push(v);
        }
        let nvars = lhs.len();

        let (nexps, mut e) = self.exp_list(exprs)?;
        if nexps != nvars {
            self.adjust_assign(nvars, nexps, &mut e)?;
            if nexps > nvars {
                // remove extra values
                self.fs_mut().free_reg -= (nexps - nvars) as u32;
            }
        } else {
            self.fs_mut().set_one_ret(&mut e);
            let last = lhs.pop().unwrap();
            self.fs_mut().store_var(&last, &mut e)?;
        }
        // remaining targets are stored in reverse source order, consuming
        // values from the top of the register stack
        for v in lhs.iter().rev() {
            let fs = self.fs_mut();
            let mut src = ExpDesc::new(ExpKind::NonReloc {
                register: fs.free_reg - 1,
            });
            fs.store_var(v, &mut src)?;
        }
        Ok(())
    }

    /// A later local target may alias the table or key register of an
    /// earlier pending indexed store; give those a safe copy.
    fn check_conflict(
        &mut self,
        lhs: &mut [ExpDesc],
        v: &ExpDesc,
    ) -> Result<(), CompileError> {
        let vreg = match v.kind {
            ExpKind::Local { register } => register,
            _ => return Ok(()),
        };
        let fs = self.fs_mut();
        let extra = fs.free_reg; // position of the safe copy
        let mut conflict = false;
        for target in lhs.iter_mut() {
            if let ExpKind::Indexed { table, key_rk } = &mut target.kind {
                if *table == vreg {
                    conflict = true;
                    *table = extra;
                }
                if *key_rk == vreg {
                    conflict = true;
                    *key_rk = extra;
                }
            }
        }
        if conflict {
            fs.code_abc(OpCode::Move, extra, vreg, 0)?;
            fs.reserve_regs(1)?;
        }
        Ok(())
    }

    fn return_stat(&mut self, exprs: &[Expr], line: u32) -> Result<(), CompileError> {
        self.fs_mut().line = line;
        let (first, nret) = if exprs.is_empty() {
            (0, 0)
        } else {
            let (n, mut e) = self.exp_list(exprs)?;
            if e.is_multi_ret() {
                self.fs_mut().set_mult_ret(&e)?;
                if n == 1 {
                    if let ExpKind::Call { pc } = e.kind {
                        // tail call
                        let fs = self.fs_mut();
                        fs.proto.code[pc].set_opcode(OpCode::TailCall);
                        debug_assert!(fs.proto.code[pc].a() == fs.nactvar);
                    }
                }
                (self.fs().nactvar, MULTRET)
            } else if n == 1 {
                let r = self.fs_mut().exp_to_any_reg(&mut e)?;
                (r, 1)
            } else {
                self.fs_mut().exp_to_next_reg(&mut e)?; // values go to the stack
                let fs = self.fs();
                debug_assert!(n as u32 == fs.free_reg - fs.nactvar);
                (fs.nactvar, n as i32)
            }
        };
        self.fs_mut().ret(first, nret)
    }

    fn break_stat(&mut self) -> Result<(), CompileError> {
        let line = self.fs().line;
        let fs = self.fs_mut();
        let mut upval = false;
        let mut target = None;
        for (i, bl) in fs.blocks.iter().enumerate().rev() {
            if bl.is_breakable {
                target = Some(i);
                break;
            }
            upval |= bl.upval;
        }
        let Some(i) = target else {
            return Err(CompileError {
                kind: CompileErrorKind::BreakOutsideLoop,
                line,
            });
        };
        if upval {
            let nactvar = fs.blocks[i].nactvar;
            fs.code_abc(OpCode::Close, nactvar, 0, 0)?;
        }
        let j = fs.jump()?;
        let merged = fs.concat(fs.blocks[i].break_list, j)?;
        fs.blocks[i].break_list = merged;
        Ok(())
    }

    /// Generate a condition: falls through when true; returns the
    /// false-exit list.
    fn cond(&mut self, e: &Expr) -> Result<i32, CompileError> {
        let mut v = self.expr(e)?;
        if matches!(v.kind, ExpKind::Nil) {
            v.kind = ExpKind::False; // all falses are equal here
        }
        self.fs_mut().go_if_true(&mut v)?;
        Ok(v.false_list)
    }

    fn while_stat(&mut self, cond: &Expr, body: &Block, line: u32) -> Result<(), CompileError> {
        self.fs_mut().line = line;
        let while_init = self.fs_mut().get_label();
        let cond_exit = self.cond(cond)?;
        self.enter_block(true);
        self.scoped_block(body)?;
        let back = self.fs_mut().jump()?;
        self.fs_mut().patch_list(back, while_init)?;
        self.leave_block()?;
        self.fs_mut().patch_to_here(cond_exit)
    }

    fn repeat_stat(&mut self, body: &Block, cond: &Expr, line: u32) -> Result<(), CompileError> {
        self.fs_mut().line = line;
        let repeat_init = self.fs_mut().get_label();
        self.enter_block(true); // loop block
        self.enter_block(false); // scope block
        self.statements(body)?;
        let cond_exit = self.cond(cond)?;
        let scope_has_upval = self.fs().blocks.last().unwrap().upval;
        if !scope_has_upval {
            self.leave_block()?; // finish scope
            self.fs_mut().patch_list(cond_exit, repeat_init)?; // close the loop
        } else {
            // locals are captured: close them before every exit
            self.break_stat()?; // if condition then break
            self.fs_mut().patch_to_here(cond_exit)?; // else...
            self.leave_block()?; // finish scope...
            let back = self.fs_mut().jump()?;
            self.fs_mut().patch_list(back, repeat_init)?; // ...and repeat
        }
        self.leave_block() // finish loop
    }

    fn if_stat(
        &mut self,
        arms: &[(Expr, Block)],
        else_body: Option<&Block>,
        line: u32,
    ) -> Result<(), CompileError> {
        self.fs_mut().line = line;
        let mut escape_list = NO_JUMP;
        let mut false_list = self.test_then_block(&arms[0])?;
        for arm in &arms[1..] {
            let j = self.fs_mut().jump()?;
            escape_list = self.fs_mut().concat(escape_list, j)?;
            self.fs_mut().patch_to_here(false_list)?;
            false_list = self.test_then_block(arm)?;
        }
        if let Some(else_block) = else_body {
            let j = self.fs_mut().jump()?;
            escape_list = self.fs_mut().concat(escape_list, j)?;
            self.fs_mut().patch_to_here(false_list)?;
            self.scoped_block(else_block)?;
        } else {
            escape_list = self.fs_mut().concat(escape_list, false_list)?;
        }
        self.fs_mut().patch_to_here(escape_list)
    }

    fn test_then_block(&mut self, arm: &(Expr, Block)) -> Result<i32, CompileError> {
        let cond_exit = self.cond(&arm.0)?;
        self.scoped_block(&arm.1)?;
        Ok(cond_exit)
    }

    fn numeric_for_stat(
        &mut self,
        var: &Name,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        self.fs_mut().line = line;
        self.enter_block(true); // scope for loop and control variables
        let base = self.fs().free_reg;
        for hidden in [&b"(for index)"[..], b"(for limit)", b"(for step)"] {
            let id = self.strings.intern(hidden);
            self.fs_mut().new_local(id)?;
        }
        self.fs_mut().new_local(var.id)?;

        let mut e = self.expr(start)?; // initial value
        self.fs_mut().exp_to_next_reg(&mut e)?;
        let mut e = self.expr(limit)?;
        self.fs_mut().exp_to_next_reg(&mut e)?;
        if let Some(step) = step {
            let mut e = self.expr(step)?;
            self.fs_mut().exp_to_next_reg(&mut e)?;
        } else {
            // default step = 1
            let fs = self.fs_mut();
            let k = fs.number_k(1.0)?;
            let reg = fs.free_reg;
            fs.code_abx(OpCode::LoadK, reg, k)?;
            fs.reserve_regs(1)?;
        }
        self.for_body(base, line, 1, true, body)?;
        self.leave_block()
    }

    fn generic_for_stat(
        &mut self,
        names: &[Name],
        exprs: &[Expr],
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        self.fs_mut().line = line;
        self.enter_block(true); // scope for loop and control variables
        let base = self.fs().free_reg;
        for hidden in [&b"(for generator)"[..], b"(for state)", b"(for control)"] {
            let id = self.strings.intern(hidden);
            self.fs_mut().new_local(id)?;
        }
        for name in names {
            self.fs_mut().new_local(name.id)?;
        }
        let iter_line = exprs[0].line();
        let (nexps, mut e) = self.exp_list(exprs)?;
        self.adjust_assign(3, nexps, &mut e)?;
        self.fs_mut().check_stack(3)?; // extra space to call the generator
        self.for_body(base, iter_line, names.len() as u32, false, body)?;
        self.leave_block()
    }

    fn for_body(
        &mut self,
        base: u32,
        line: u32,
        nvars: u32,
        is_numeric: bool,
        body: &Block,
    ) -> Result<(), CompileError> {
        self.fs_mut().adjust_local_vars(3); // control variables
        let prep = if is_numeric {
            self.fs_mut().code_asbx(OpCode::ForPrep, base, NO_JUMP)? as i32
        } else {
            self.fs_mut().jump()?
        };
        self.enter_block(false); // scope for declared variables
        self.fs_mut().adjust_local_vars(nvars);
        self.fs_mut().reserve_regs(nvars)?;
        self.statements(body)?;
        self.leave_block()?;
        self.fs_mut().patch_to_here(prep)?;
        let end = if is_numeric {
            self.fs_mut().code_asbx(OpCode::ForLoop, base, NO_JUMP)? as i32
        } else {
            self.fs_mut().code_abc(OpCode::TForLoop, base, 0, nvars)? as i32
        };
        self.fs_mut().fix_line(line); // pretend that the loop op starts the loop
        let back = if is_numeric {
            end
        } else {
            self.fs_mut().jump()?
        };
        self.fs_mut().patch_list(back, prep + 1)
    }

    fn function_stat(
        &mut self,
        name: &crate::ast::FuncName,
        body: &FuncBody,
    ) -> Result<(), CompileError> {
        let line = body.line;
        self.fs_mut().line = line;
        let mut v = self.single_var(&name.base)?;
        for field in &name.fields {
            self.fs_mut().exp_to_any_reg(&mut v)?;
            let mut key = self.string_desc(field.id)?;
            self.fs_mut().indexed(&mut v, &mut key)?;
        }
        if let Some(method) = &name.method {
            self.fs_mut().exp_to_any_reg(&mut v)?;
            let mut key = self.string_desc(method.id)?;
            self.fs_mut().indexed(&mut v, &mut key)?;
        }
        let mut b = self.push_function(body, name.method.is_some())?;
        self.fs_mut().store_var(&v, &mut b)?;
        self.fs_mut().fix_line(line); // definition happens in the first line
        Ok(())
    }

    // ---- Expressions ----

    fn expr(&mut self, e: &Expr) -> Result<ExpDesc, CompileError> {
        self.fs_mut().line = e.line();
        match e {
            Expr::Nil { .. } => Ok(ExpDesc::new(ExpKind::Nil)),
            Expr::True { .. } => Ok(ExpDesc::new(ExpKind::True)),
            Expr::False { .. } => Ok(ExpDesc::new(ExpKind::False)),
            Expr::Number { value, .. } => Ok(ExpDesc::number(*value)),
            Expr::Str { id, .. } => self.string_desc(*id),
            Expr::Vararg { .. } => {
                if self.fs().proto.is_vararg & VARARG_ISVARARG == 0 {
                    return Err(self.error(CompileErrorKind::VarargOutsideFunction));
                }
                let fs = self.fs_mut();
                fs.proto.is_vararg &= !VARARG_NEEDSARG; // no need for 'arg'
                let pc = fs.code_abc(OpCode::VarArg, 0, 1, 0)?;
                Ok(ExpDesc::new(ExpKind::Vararg { pc }))
            }
            Expr::Function(body) => self.push_function(body, false),
            Expr::Name(name) => self.single_var(name),
            Expr::Paren(inner) => {
                let mut v = self.expr(inner)?;
                self.fs_mut().discharge_vars(&mut v)?;
                Ok(v)
            }
            Expr::Index { obj, key, line } => {
                let mut t = self.expr(obj)?;
                self.fs_mut().exp_to_any_reg(&mut t)?;
                let mut k = self.expr(key)?;
                self.fs_mut().line = *line;
                self.fs_mut().indexed(&mut t, &mut k)?;
                Ok(t)
            }
            Expr::Call { func, args, line } => {
                let mut f = self.expr(func)?;
                self.fs_mut().exp_to_next_reg(&mut f)?;
                self.finish_call(&f, args, *line)
            }
            Expr::MethodCall {
                obj,
                method,
                args,
                line,
            } => {
                let mut f = self.expr(obj)?;
                let mut key = self.string_desc(method.id)?;
                self.fs_mut().op_self(&mut f, &mut key)?;
                self.finish_call(&f, args, *line)
            }
            Expr::Table { fields, line } => self.constructor(fields, *line),
            Expr::BinOp { op, lhs, rhs, .. } => {
                let mut e1 = self.expr(lhs)?;
                self.fs_mut().infix(*op, &mut e1)?;
                let mut e2 = self.expr(rhs)?;
                self.fs_mut().posfix(*op, &mut e1, &mut e2)?;
                Ok(e1)
            }
            Expr::UnOp { op, operand, line } => {
                let mut e = self.expr(operand)?;
                self.fs_mut().line = *line;
                self.fs_mut().prefix(*op, &mut e)?;
                Ok(e)
            }
        }
    }

    fn string_desc(&mut self, id: StringId) -> Result<ExpDesc, CompileError> {
        let index = self.fs_mut().string_k(id)?;
        Ok(ExpDesc::new(ExpKind::K { index }))
    }

    /// Resolve a name: local, then upvalue chain, then global.
    fn single_var(&mut self, name: &Name) -> Result<ExpDesc, CompileError> {
        self.fs_mut().line = name.line;
        let top = self.func_stack.len() - 1;
        match self.single_var_aux(top, name.id, true)? {
            Some(e) => Ok(e),
            None => {
                let name_k = self.fs_mut().string_k(name.id)?;
                Ok(ExpDesc::new(ExpKind::Global { name_k }))
            }
        }
    }

    /// Walk enclosing frames for `name`; captures upvalues on the way back
    /// down. `None` means global.
    fn single_var_aux(
        &mut self,
        level: usize,
        name: StringId,
        base: bool,
    ) -> Result<Option<ExpDesc>, CompileError> {
        if let Some(register) = self.func_stack[level].search_var(name) {
            if !base {
                // this local is captured by some nested function
                self.func_stack[level].mark_upval(register);
            }
            return Ok(Some(ExpDesc::new(ExpKind::Local { register })));
        }
        if level == 0 {
            return Ok(None);
        }
        match self.single_var_aux(level - 1, name, false)? {
            None => Ok(None),
            Some(parent) => {
                let index = self.index_upvalue(level, name, &parent)?;
                Ok(Some(ExpDesc::new(ExpKind::Upvalue { index })))
            }
        }
    }

    fn index_upvalue(
        &mut self,
        level: usize,
        name: StringId,
        captured: &ExpDesc,
    ) -> Result<u32, CompileError> {
        let (in_stack, index) = match captured.kind {
            ExpKind::Local { register } => (true, register),
            ExpKind::Upvalue { index } => (false, index),
            _ => unreachable!(),
        };
        let line = self.fs().line;
        let fs = &mut self.func_stack[level];
        for (i, up) in fs.upvalues.iter().enumerate() {
            if up.in_stack == in_stack && up.index == index {
                return Ok(i as u32);
            }
        }
        if fs.upvalues.len() >= MAX_UPVALUES {
            return Err(CompileError {
                kind: CompileErrorKind::TooManyUpvalues,
                line,
            });
        }
        fs.upvalues.push(UpvalDesc {
            name,
            in_stack,
            index,
        });
        fs.proto.upvalue_names.push(name);
        Ok((fs.upvalues.len() - 1) as u32)
    }

    /// Arguments and CALL emission; the callee sits in `f`'s register.
    fn finish_call(
        &mut self,
        f: &ExpDesc,
        args: &[Expr],
        line: u32,
    ) -> Result<ExpDesc, CompileError> {
        let base = match f.kind {
            ExpKind::NonReloc { register } => register,
            _ => unreachable!("callee not in a register"),
        };
        let nparams: i32;
        if args.is_empty() {
            nparams = (self.fs().free_reg - (base + 1)) as i32;
        } else {
            let (_, mut last) = self.exp_list(args)?;
            if last.is_multi_ret() {
                self.fs_mut().set_mult_ret(&last)?; // open call
                nparams = MULTRET;
            } else {
                self.fs_mut().exp_to_next_reg(&mut last)?; // close last argument
                nparams = (self.fs().free_reg - (base + 1)) as i32;
            }
        }
        let pc = self
            .fs_mut()
            .code_abc(OpCode::Call, base, (nparams + 1) as u32, 2)?;
        self.fs_mut().fix_line(line);
        // the call removes function and arguments, leaving one result
        self.fs_mut().free_reg = base + 1;
        Ok(ExpDesc::new(ExpKind::Call { pc }))
    }

    /// `{ ... }`: NEWTABLE plus keyed SETTABLEs and batched SETLISTs.
    fn constructor(
        &mut self,
        fields: &[TableField],
        line: u32,
    ) -> Result<ExpDesc, CompileError> {
        self.fs_mut().line = line;
        let pc = self.fs_mut().code_abc(OpCode::NewTable, 0, 0, 0)?;
        let mut t = ExpDesc::new(ExpKind::Relocable { pc });
        self.fs_mut().exp_to_next_reg(&mut t)?; // fix it at stack top
        let table_reg = match t.kind {
            ExpKind::NonReloc { register } => register,
            _ => unreachable!(),
        };

        let mut na = 0u32; // total array elements
        let mut nh = 0u32; // total keyed elements
        let mut tostore = 0i32; // array elements pending a flush
        let mut pending = ExpDesc::void(); // last array item, still open

        for field in fields {
            debug_assert!(matches!(pending.kind, ExpKind::Void) || tostore > 0);
            // close the previous array item
            if !matches!(pending.kind, ExpKind::Void) {
                self.fs_mut().exp_to_next_reg(&mut pending)?;
                pending = ExpDesc::void();
                if tostore == crate::opcode::FIELDS_PER_FLUSH as i32 {
                    self.fs_mut().set_list(table_reg, na, tostore)?; // flush
                    tostore = 0; // no more pending items
                }
            }
            match field {
                TableField::Item(item) => {
                    pending = self.expr(item)?;
                    na += 1;
                    tostore += 1;
                }
                TableField::Pair(key, value) => {
                    nh += 1;
                    let reg = self.fs().free_reg;
                    let mut k = self.expr(key)?;
                    let key_rk = self.fs_mut().exp_to_rk(&mut k)?;
                    let mut v = self.expr(value)?;
                    let val_rk = self.fs_mut().exp_to_rk(&mut v)?;
                    self.fs_mut()
                        .code_abc(OpCode::SetTable, table_reg, key_rk, val_rk)?;
                    self.fs_mut().free_reg = reg; // free registers
                }
            }
        }

        if tostore != 0 {
            if pending.is_multi_ret() {
                self.fs_mut().set_mult_ret(&pending)?;
                self.fs_mut().set_list(table_reg, na, MULTRET)?;
                // do not count the last expression: its element count is
                // unknown when pre-sizing
                na -= 1;
            } else {
                if !matches!(pending.kind, ExpKind::Void) {
                    self.fs_mut().exp_to_next_reg(&mut pending)?;
                }
                self.fs_mut().set_list(table_reg, na, tostore)?;
            }
        }

        let fs = self.fs_mut();
        fs.proto.code[pc].set_b(int2fb(na)); // initial array size
        fs.proto.code[pc].set_c(int2fb(nh)); // initial hash size
        Ok(ExpDesc::new(ExpKind::NonReloc {
            register: table_reg,
        }))
    }

    /// Compile a nested function body and emit CLOSURE plus the upvalue
    /// pseudo-instructions in the enclosing function.
    fn push_function(
        &mut self,
        body: &FuncBody,
        is_method: bool,
    ) -> Result<ExpDesc, CompileError> {
        let mut fs = FuncState::new();
        fs.proto.source = self.fs().proto.source;
        fs.proto.line_defined = body.line;
        fs.line = body.line;
        self.func_stack.push(fs);

        // parameter list
        let mut nparams = 0u32;
        if is_method {
            let self_id = self.strings.intern(b"self");
            self.fs_mut().new_local(self_id)?;
            nparams += 1;
        }
        for param in &body.params {
            self.fs_mut().new_local(param.id)?;
            nparams += 1;
        }
        if body.is_vararg {
            // compatibility vararg: a hidden 'arg' parameter, dropped again
            // if '...' is actually used
            let arg_id = self.strings.intern(b"arg");
            self.fs_mut().new_local(arg_id)?;
            nparams += 1;
            self.fs_mut().proto.is_vararg =
                VARARG_HASARG | VARARG_NEEDSARG | VARARG_ISVARARG;
        }
        self.fs_mut().adjust_local_vars(nparams);
        {
            let fs = self.fs_mut();
            let has_arg = (fs.proto.is_vararg & VARARG_HASARG != 0) as u32;
            fs.proto.num_params = (fs.nactvar - has_arg) as u8;
            let n = fs.nactvar;
            fs.reserve_regs(n)?;
        }

        self.statements(&body.body)?;
        self.fs_mut().proto.last_line_defined = body.end_line;
        self.fs_mut().line = body.end_line;
        let child = self.close_func()?;

        let parent = self.fs_mut();
        parent.line = body.end_line;
        parent.proto.protos.push(child.proto);
        let proto_index = (parent.proto.protos.len() - 1) as u32;
        let pc = parent.code_abx(OpCode::Closure, 0, proto_index)?;
        for up in &child.upvalues {
            let op = if up.in_stack {
                OpCode::Move
            } else {
                OpCode::GetUpval
            };
            parent.code_abc(op, 0, up.index, 0)?;
        }
        Ok(ExpDesc::new(ExpKind::Relocable { pc }))
    }
}
