/// Per-function compilation state: instruction buffer, constants, register
/// watermark, active locals, and the jump-patching machinery. The methods
/// here mirror the reference code generator operation for operation, since
/// the output must be bit-identical to it.
use crate::ast::{BinOp, UnOp};
use crate::codegen::expr::{ExpDesc, ExpKind, UpvalDesc, NO_JUMP};
use crate::codegen::{CompileError, CompileErrorKind};
use crate::opcode::{
    self, Instruction, OpCode, FIELDS_PER_FLUSH, MAX_C, MAX_INDEX_RK, MAX_SBX, MAX_STACK,
    MAX_VARS, NO_REG,
};
use crate::proto::{Constant, LocalVar, Proto};
use lunac_core::string::StringId;

/// "As many results as available" marker for call/return counts.
pub const MULTRET: i32 = -1;

/// An enclosing block: scope boundary, break target, and whether any local
/// declared in it is captured by a closure (forcing a CLOSE on exit).
#[derive(Clone, Debug)]
pub struct BlockCx {
    pub break_list: i32,
    pub nactvar: u32,
    pub upval: bool,
    pub is_breakable: bool,
}

pub struct FuncState {
    pub proto: Proto,
    /// First free register.
    pub free_reg: u32,
    /// Number of active local variables.
    pub nactvar: u32,
    /// Active (and pending) locals: indices into `proto.local_vars`.
    pub actvar: Vec<usize>,
    /// Enclosing block stack.
    pub blocks: Vec<BlockCx>,
    /// Upvalues captured so far.
    pub upvalues: Vec<UpvalDesc>,
    /// List of pending jumps to the next instruction.
    jpc: i32,
    /// Position of the last jump target, to avoid wrong optimizations over
    /// labels.
    last_target: i32,
    /// Line stamped onto emitted instructions.
    pub line: u32,
}

impl FuncState {
    pub fn new() -> Self {
        FuncState {
            proto: Proto::new(),
            free_reg: 0,
            nactvar: 0,
            actvar: Vec::new(),
            blocks: Vec::new(),
            upvalues: Vec::new(),
            jpc: NO_JUMP,
            last_target: -1,
            line: 0,
        }
    }

    fn err(&self, kind: CompileErrorKind) -> CompileError {
        CompileError {
            kind,
            line: self.line,
        }
    }

    pub fn pc(&self) -> i32 {
        self.proto.code_len() as i32
    }

    // ---- Instruction emission ----

    pub fn code(&mut self, inst: Instruction) -> Result<usize, CompileError> {
        self.discharge_jpc()?; // pc is about to change
        Ok(self.proto.emit(inst, self.line))
    }

    pub fn code_abc(
        &mut self,
        op: OpCode,
        a: u32,
        b: u32,
        c: u32,
    ) -> Result<usize, CompileError> {
        self.code(Instruction::abc(op, a, b, c))
    }

    pub fn code_abx(&mut self, op: OpCode, a: u32, bx: u32) -> Result<usize, CompileError> {
        self.code(Instruction::abx(op, a, bx))
    }

    pub fn code_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> Result<usize, CompileError> {
        self.code(Instruction::asbx(op, a, sbx))
    }

    /// Re-stamp the last emitted instruction with another line.
    pub fn fix_line(&mut self, line: u32) {
        if let Some(last) = self.proto.line_info.last_mut() {
            *last = line;
        }
    }

    fn remove_last_instruction(&mut self) {
        self.proto.code.pop();
        self.proto.line_info.pop();
    }

    /// Emit a LOADNIL, merging it into an immediately preceding one when
    /// the ranges connect and no jump targets the current position.
    pub fn load_nil(&mut self, from: u32, n: u32) -> Result<(), CompileError> {
        if self.pc() > self.last_target {
            if self.pc() == 0 {
                // function start: registers are already nil
                if from >= self.nactvar {
                    return Ok(());
                }
            } else {
                let prev = self.proto.code[self.proto.code_len() - 1];
                if prev.opcode() == OpCode::LoadNil {
                    let pfrom = prev.a();
                    let pto = prev.b();
                    if pfrom <= from && from <= pto + 1 {
                        if from + n - 1 > pto {
                            let len = self.proto.code_len();
                            self.proto.code[len - 1].set_b(from + n - 1);
                        }
                        return Ok(());
                    }
                }
            }
        }
        self.code_abc(OpCode::LoadNil, from, from + n - 1, 0)?;
        Ok(())
    }

    pub fn ret(&mut self, first: u32, nret: i32) -> Result<(), CompileError> {
        self.code_abc(OpCode::Return, first, (nret + 1) as u32, 0)?;
        Ok(())
    }

    // ---- Constants ----

    fn add_constant(&mut self, k: Constant) -> Result<u32, CompileError> {
        self.proto
            .intern_constant(k)
            .ok_or_else(|| self.err(CompileErrorKind::ConstantOverflow))
    }

    pub fn string_k(&mut self, id: StringId) -> Result<u32, CompileError> {
        self.add_constant(Constant::String(id))
    }

    pub fn number_k(&mut self, n: f64) -> Result<u32, CompileError> {
        self.add_constant(Constant::Number(n))
    }

    pub fn bool_k(&mut self, b: bool) -> Result<u32, CompileError> {
        self.add_constant(Constant::Boolean(b))
    }

    pub fn nil_k(&mut self) -> Result<u32, CompileError> {
        self.add_constant(Constant::Nil)
    }

    // ---- Registers ----

    pub fn check_stack(&mut self, n: u32) -> Result<(), CompileError> {
        let new_stack = self.free_reg + n;
        if new_stack > self.proto.max_stack_size as u32 {
            if new_stack as usize >= MAX_STACK {
                return Err(self.err(CompileErrorKind::ExpressionTooComplex));
            }
            self.proto.max_stack_size = new_stack as u8;
        }
        Ok(())
    }

    pub fn reserve_regs(&mut self, n: u32) -> Result<(), CompileError> {
        self.check_stack(n)?;
        self.free_reg += n;
        Ok(())
    }

    /// Free a register: only the topmost temporary may be freed; locals and
    /// RK constants are untouched.
    pub fn free_register(&mut self, reg: u32) {
        if !opcode::is_k(reg) && reg >= self.nactvar {
            self.free_reg -= 1;
            debug_assert!(reg == self.free_reg, "register free out of order");
        }
    }

    pub fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc { register } = e.kind {
            self.free_register(register);
        }
    }

    // ---- Local variables ----

    /// Register a new local (not yet active).
    pub fn new_local(&mut self, name: StringId) -> Result<(), CompileError> {
        if self.actvar.len() + 1 > MAX_VARS {
            return Err(self.err(CompileErrorKind::TooManyLocals));
        }
        let idx = self.proto.local_vars.len();
        self.proto.local_vars.push(LocalVar {
            name,
            start_pc: 0,
            end_pc: 0,
        });
        self.actvar.push(idx);
        Ok(())
    }

    /// Activate the last `nvars` registered locals, stamping their
    /// active-from point.
    pub fn adjust_local_vars(&mut self, nvars: u32) {
        let pc = self.pc() as u32;
        for i in 0..nvars {
            let idx = self.actvar[(self.nactvar + i) as usize];
            self.proto.local_vars[idx].start_pc = pc;
        }
        self.nactvar += nvars;
    }

    /// Deactivate locals down to `to_level`, stamping their dead-from point.
    pub fn remove_vars(&mut self, to_level: u32) {
        let pc = self.pc() as u32;
        while self.nactvar > to_level {
            self.nactvar -= 1;
            let idx = self.actvar[self.nactvar as usize];
            self.proto.local_vars[idx].end_pc = pc;
        }
        self.actvar.truncate(self.nactvar as usize);
    }

    /// Find an active local by name; returns its register.
    pub fn search_var(&self, name: StringId) -> Option<u32> {
        (0..self.nactvar).rev().find(|&i| {
            let idx = self.actvar[i as usize];
            self.proto.local_vars[idx].name == name
        })
    }

    /// Mark the block where the local at `level` lives as having a captured
    /// variable, so it emits CLOSE on exit.
    pub fn mark_upval(&mut self, level: u32) {
        for b in self.blocks.iter_mut().rev() {
            if b.nactvar <= level {
                b.upval = true;
                return;
            }
        }
    }

    // ---- Jump machinery ----

    pub fn jump(&mut self) -> Result<i32, CompileError> {
        let jpc = self.jpc; // save list of jumps to here
        self.jpc = NO_JUMP;
        let j = self.code_asbx(OpCode::Jmp, 0, NO_JUMP)? as i32;
        self.concat(j, jpc) // keep them on hold
    }

    /// Mark the current position as a jump target, blocking peephole
    /// optimizations across it.
    pub fn get_label(&mut self) -> i32 {
        self.last_target = self.pc();
        self.last_target
    }

    fn get_jump(&self, pc: i32) -> i32 {
        let offset = self.proto.code[pc as usize].sbx();
        if offset == NO_JUMP {
            NO_JUMP // end of list
        } else {
            pc + 1 + offset
        }
    }

    fn fix_jump(&mut self, pc: i32, dest: i32) -> Result<(), CompileError> {
        debug_assert!(dest != NO_JUMP);
        let offset = dest - (pc + 1);
        if offset.abs() > MAX_SBX {
            return Err(self.err(CompileErrorKind::ControlStructureTooLong));
        }
        self.proto.code[pc as usize].set_sbx(offset);
        Ok(())
    }

    /// The instruction controlling a jump: the preceding test, if any.
    fn jump_control_pc(&self, pc: i32) -> usize {
        let pc = pc as usize;
        if pc >= 1 && self.proto.code[pc - 1].opcode().is_test() {
            pc - 1
        } else {
            pc
        }
    }

    /// Concatenate jump list `l2` onto `l1`, returning the merged list.
    pub fn concat(&mut self, l1: i32, l2: i32) -> Result<i32, CompileError> {
        if l2 == NO_JUMP {
            return Ok(l1);
        }
        if l1 == NO_JUMP {
            return Ok(l2);
        }
        let mut list = l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2)?;
        Ok(l1)
    }

    /// Does any jump in the list demand a materialized value (its control
    /// is not a TESTSET)?
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let i = self.proto.code[self.jump_control_pc(list)];
            if i.opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    /// Point a TESTSET's destination at `reg`, or degrade it to TEST when
    /// no value is wanted. Returns false if the jump has no TESTSET.
    fn patch_test_reg(&mut self, node: i32, reg: u32) -> bool {
        let ipc = self.jump_control_pc(node);
        let i = self.proto.code[ipc];
        if i.opcode() != OpCode::TestSet {
            return false; // cannot patch other instructions
        }
        if reg != NO_REG && reg != i.b() {
            self.proto.code[ipc].set_a(reg);
        } else {
            // no register to put value or register already has the value
            self.proto.code[ipc] = Instruction::abc(OpCode::Test, i.b(), 0, i.c());
        }
        true
    }

    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u32,
        dtarget: i32,
    ) -> Result<(), CompileError> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?; // jump to default target
            }
            list = next;
        }
        Ok(())
    }

    fn discharge_jpc(&mut self) -> Result<(), CompileError> {
        let jpc = self.jpc;
        self.jpc = NO_JUMP;
        let pc = self.pc();
        self.patch_list_aux(jpc, pc, NO_REG, pc)
    }

    pub fn patch_list(&mut self, list: i32, target: i32) -> Result<(), CompileError> {
        if target == self.pc() {
            self.patch_to_here(list)
        } else {
            debug_assert!(target < self.pc());
            self.patch_list_aux(list, target, NO_REG, target)
        }
    }

    pub fn patch_to_here(&mut self, list: i32) -> Result<(), CompileError> {
        self.get_label();
        let jpc = self.jpc;
        self.jpc = self.concat(jpc, list)?;
        Ok(())
    }

    fn cond_jump(
        &mut self,
        op: OpCode,
        a: u32,
        b: u32,
        c: u32,
    ) -> Result<i32, CompileError> {
        self.code_abc(op, a, b, c)?;
        self.jump()
    }

    // ---- Multiple results ----

    pub fn set_returns(&mut self, e: &ExpDesc, nresults: i32) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Call { pc } => {
                self.proto.code[pc].set_c((nresults + 1) as u32);
            }
            ExpKind::Vararg { pc } => {
                self.proto.code[pc].set_b((nresults + 1) as u32);
                let free = self.free_reg;
                self.proto.code[pc].set_a(free);
                self.reserve_regs(1)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn set_mult_ret(&mut self, e: &ExpDesc) -> Result<(), CompileError> {
        self.set_returns(e, MULTRET)
    }

    pub fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call { pc } => {
                let a = self.proto.code[pc].a();
                e.kind = ExpKind::NonReloc { register: a };
            }
            ExpKind::Vararg { pc } => {
                self.proto.code[pc].set_b(2);
                e.kind = ExpKind::Relocable { pc }; // can relocate its single result
            }
            _ => {}
        }
    }

    // ---- Expression discharge ----

    /// Resolve variable references: locals become fixed registers, global,
    /// upvalue, and indexed reads are emitted as relocatable instructions,
    /// and open calls/varargs are closed to one result.
    pub fn discharge_vars(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Local { register } => {
                e.kind = ExpKind::NonReloc { register };
            }
            ExpKind::Upvalue { index } => {
                let pc = self.code_abc(OpCode::GetUpval, 0, index, 0)?;
                e.kind = ExpKind::Relocable { pc };
            }
            ExpKind::Global { name_k } => {
                let pc = self.code_abx(OpCode::GetGlobal, 0, name_k)?;
                e.kind = ExpKind::Relocable { pc };
            }
            ExpKind::Indexed { table, key_rk } => {
                // free in this order: key, then table
                self.free_register(key_rk);
                self.free_register(table);
                let pc = self.code_abc(OpCode::GetTable, 0, table, key_rk)?;
                e.kind = ExpKind::Relocable { pc };
            }
            ExpKind::Call { .. } | ExpKind::Vararg { .. } => {
                self.set_one_ret(e);
            }
            _ => {} // there is one value available (somewhere)
        }
        Ok(())
    }

    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExpKind::Nil => {
                self.load_nil(reg, 1)?;
            }
            ExpKind::False => {
                self.code_abc(OpCode::LoadBool, reg, 0, 0)?;
            }
            ExpKind::True => {
                self.code_abc(OpCode::LoadBool, reg, 1, 0)?;
            }
            ExpKind::K { index } => {
                self.code_abx(OpCode::LoadK, reg, index)?;
            }
            ExpKind::Number { value } => {
                let k = self.number_k(value)?;
                self.code_abx(OpCode::LoadK, reg, k)?;
            }
            ExpKind::Relocable { pc } => {
                self.proto.code[pc].set_a(reg);
            }
            ExpKind::NonReloc { register } => {
                if register != reg {
                    self.code_abc(OpCode::Move, reg, register, 0)?;
                }
            }
            ExpKind::Void | ExpKind::Jump { .. } => {
                return Ok(()); // nothing to do
            }
            _ => unreachable!("cannot discharge {:?}", e.kind),
        }
        e.kind = ExpKind::NonReloc { register: reg };
        Ok(())
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::NonReloc { .. }) {
            self.reserve_regs(1)?;
            self.discharge_to_reg(e, self.free_reg - 1)?;
        }
        Ok(())
    }

    fn code_label(&mut self, a: u32, b: u32, jump: u32) -> Result<i32, CompileError> {
        self.get_label(); // those instructions may be jump targets
        Ok(self.code_abc(OpCode::LoadBool, a, b, jump)? as i32)
    }

    /// Force `e` (and its pending jumps) into register `reg`.
    fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), CompileError> {
        self.discharge_to_reg(e, reg)?;
        if let ExpKind::Jump { pc } = e.kind {
            e.true_list = self.concat(e.true_list, pc)?; // put this jump in the true list
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP; // position of an eventual LOADBOOL false
            let mut p_t = NO_JUMP; // position of an eventual LOADBOOL true
            if self.need_value(e.true_list) || self.need_value(e.false_list) {
                let fj = if matches!(e.kind, ExpKind::Jump { .. }) {
                    NO_JUMP
                } else {
                    self.jump()?
                };
                p_f = self.code_label(reg, 0, 1)?;
                p_t = self.code_label(reg, 1, 0)?;
                self.patch_to_here(fj)?;
            }
            let end = self.get_label(); // position after the whole expression
            self.patch_list_aux(e.false_list, end, reg, p_f)?;
            self.patch_list_aux(e.true_list, end, reg, p_t)?;
        }
        e.true_list = NO_JUMP;
        e.false_list = NO_JUMP;
        e.kind = ExpKind::NonReloc { register: reg };
        Ok(())
    }

    /// Free any temporary held by `e`, reserve the next register, and
    /// discharge into it.
    pub fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        self.free_exp(e);
        self.reserve_regs(1)?;
        self.exp_to_reg(e, self.free_reg - 1)
    }

    /// Put `e` in some register, returning it. A value already sitting in a
    /// non-local register stays put.
    pub fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<u32, CompileError> {
        self.discharge_vars(e)?;
        if let ExpKind::NonReloc { register } = e.kind {
            if !e.has_jumps() {
                return Ok(register);
            }
            if register >= self.nactvar {
                // not a local: put the final value there
                self.exp_to_reg(e, register)?;
                return Ok(register);
            }
        }
        self.exp_to_next_reg(e)?;
        match e.kind {
            ExpKind::NonReloc { register } => Ok(register),
            _ => unreachable!(),
        }
    }

    pub fn exp_to_val(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)?;
            Ok(())
        } else {
            self.discharge_vars(e)
        }
    }

    /// Encode `e` as an RK operand: a small-enough constant index when
    /// possible, a register otherwise.
    pub fn exp_to_rk(&mut self, e: &mut ExpDesc) -> Result<u32, CompileError> {
        self.exp_to_val(e)?;
        match e.kind {
            ExpKind::Number { value } => {
                if self.proto.constants.len() as u32 <= MAX_INDEX_RK {
                    let index = self.number_k(value)?;
                    e.kind = ExpKind::K { index };
                    return Ok(opcode::rk_as_k(index));
                }
            }
            ExpKind::True | ExpKind::False => {
                if self.proto.constants.len() as u32 <= MAX_INDEX_RK {
                    let index = self.bool_k(matches!(e.kind, ExpKind::True))?;
                    e.kind = ExpKind::K { index };
                    return Ok(opcode::rk_as_k(index));
                }
            }
            ExpKind::Nil => {
                if self.proto.constants.len() as u32 <= MAX_INDEX_RK {
                    let index = self.nil_k()?;
                    e.kind = ExpKind::K { index };
                    return Ok(opcode::rk_as_k(index));
                }
            }
            ExpKind::K { index } => {
                if index <= MAX_INDEX_RK {
                    return Ok(opcode::rk_as_k(index));
                }
            }
            _ => {}
        }
        // not a constant in the right range: put it in a register
        self.exp_to_any_reg(e)
    }

    /// Store `ex` into the variable described by `var`.
    pub fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> Result<(), CompileError> {
        match var.kind {
            ExpKind::Local { register } => {
                self.free_exp(ex);
                return self.exp_to_reg(ex, register);
            }
            ExpKind::Upvalue { index } => {
                let e = self.exp_to_any_reg(ex)?;
                self.code_abc(OpCode::SetUpval, e, index, 0)?;
            }
            ExpKind::Global { name_k } => {
                let e = self.exp_to_any_reg(ex)?;
                self.code_abx(OpCode::SetGlobal, e, name_k)?;
            }
            ExpKind::Indexed { table, key_rk } => {
                let e = self.exp_to_rk(ex)?;
                self.code_abc(OpCode::SetTable, table, key_rk, e)?;
            }
            _ => unreachable!("invalid assignment target"),
        }
        self.free_exp(ex);
        Ok(())
    }

    /// `e:key` for a method call: SELF leaves the method at `base` and the
    /// receiver at `base + 1`.
    pub fn op_self(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> Result<(), CompileError> {
        self.exp_to_any_reg(e)?;
        let obj = match e.kind {
            ExpKind::NonReloc { register } => register,
            _ => unreachable!(),
        };
        self.free_exp(e);
        let base = self.free_reg;
        self.reserve_regs(2)?; // function and `self' produced by SELF
        let key_rk = self.exp_to_rk(key)?;
        self.code_abc(OpCode::Self_, base, obj, key_rk)?;
        self.free_exp(key);
        e.kind = ExpKind::NonReloc { register: base };
        Ok(())
    }

    /// Turn `t` into `t[k]`, with `k` as an RK operand. `t` must already be
    /// in a register.
    pub fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> Result<(), CompileError> {
        let key_rk = self.exp_to_rk(k)?;
        let table = match t.kind {
            ExpKind::NonReloc { register } | ExpKind::Local { register } => register,
            _ => unreachable!("table not in a register"),
        };
        t.kind = ExpKind::Indexed { table, key_rk };
        Ok(())
    }

    // ---- Conditions ----

    fn invert_jump(&mut self, e: &ExpDesc) {
        let pc = match e.kind {
            ExpKind::Jump { pc } => pc,
            _ => unreachable!(),
        };
        let ipc = self.jump_control_pc(pc);
        let i = self.proto.code[ipc];
        debug_assert!(
            i.opcode().is_test() && i.opcode() != OpCode::TestSet && i.opcode() != OpCode::Test
        );
        let a = i.a();
        self.proto.code[ipc].set_a(if a == 0 { 1 } else { 0 });
    }

    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> Result<i32, CompileError> {
        if let ExpKind::Relocable { pc } = e.kind {
            let ie = self.proto.code[pc];
            if ie.opcode() == OpCode::Not {
                // remove previous NOT and invert the condition
                self.remove_last_instruction();
                return self.cond_jump(OpCode::Test, ie.b(), 0, !cond as u32);
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        let register = match e.kind {
            ExpKind::NonReloc { register } => register,
            _ => unreachable!(),
        };
        self.cond_jump(OpCode::TestSet, NO_REG, register, cond as u32)
    }

    /// Emit code so that execution falls through when `e` is true; false
    /// exits collect in the false list.
    pub fn go_if_true(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::K { .. } | ExpKind::Number { .. } | ExpKind::True => NO_JUMP, // always true
            ExpKind::Jump { pc } => {
                self.invert_jump(e);
                pc
            }
            _ => self.jump_on_cond(e, false)?,
        };
        e.false_list = self.concat(e.false_list, pc)?;
        self.patch_to_here(e.true_list)?;
        e.true_list = NO_JUMP;
        Ok(())
    }

    /// Emit code so that execution falls through when `e` is false; true
    /// exits collect in the true list.
    pub fn go_if_false(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Nil | ExpKind::False => NO_JUMP, // always false
            ExpKind::Jump { pc } => pc,
            _ => self.jump_on_cond(e, true)?,
        };
        e.true_list = self.concat(e.true_list, pc)?;
        self.patch_to_here(e.false_list)?;
        e.false_list = NO_JUMP;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExpKind::Nil | ExpKind::False => {
                e.kind = ExpKind::True;
            }
            ExpKind::K { .. } | ExpKind::Number { .. } | ExpKind::True => {
                e.kind = ExpKind::False;
            }
            ExpKind::Jump { .. } => {
                self.invert_jump(e);
            }
            ExpKind::Relocable { .. } | ExpKind::NonReloc { .. } => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let register = match e.kind {
                    ExpKind::NonReloc { register } => register,
                    _ => unreachable!(),
                };
                let pc = self.code_abc(OpCode::Not, 0, register, 0)?;
                e.kind = ExpKind::Relocable { pc };
            }
            _ => unreachable!(),
        }
        // interchange true and false lists
        std::mem::swap(&mut e.true_list, &mut e.false_list);
        self.remove_values(e.false_list);
        self.remove_values(e.true_list);
        Ok(())
    }

    // ---- Operators ----

    fn code_arith(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        if const_fold(op, e1, e2) {
            return Ok(());
        }
        let o2 = if op != OpCode::Unm && op != OpCode::Len {
            self.exp_to_rk(e2)?
        } else {
            0
        };
        let o1 = self.exp_to_rk(e1)?;
        // free the higher register first
        if o1 > o2 {
            self.free_exp(e1);
            self.free_exp(e2);
        } else {
            self.free_exp(e2);
            self.free_exp(e1);
        }
        let pc = self.code_abc(op, 0, o1, o2)?;
        e1.kind = ExpKind::Relocable { pc };
        Ok(())
    }

    fn code_comp(
        &mut self,
        op: OpCode,
        cond: bool,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let mut o1 = self.exp_to_rk(e1)?;
        let mut o2 = self.exp_to_rk(e2)?;
        self.free_exp(e2);
        self.free_exp(e1);
        let mut cond = cond as u32;
        if cond == 0 && op != OpCode::Eq {
            // exchange args to replace by `<' or `<='
            std::mem::swap(&mut o1, &mut o2);
            cond = 1;
        }
        let pc = self.cond_jump(op, cond, o1, o2)?;
        e1.kind = ExpKind::Jump { pc };
        Ok(())
    }

    pub fn prefix(&mut self, op: UnOp, e: &mut ExpDesc) -> Result<(), CompileError> {
        let mut fake = ExpDesc::number(0.0);
        match op {
            UnOp::Neg => {
                if !e.is_numeral() {
                    // cannot operate on non-numeric constants
                    self.exp_to_any_reg(e)?;
                }
                self.code_arith(OpCode::Unm, e, &mut fake)
            }
            UnOp::Not => self.code_not(e),
            UnOp::Len => {
                self.exp_to_any_reg(e)?; // cannot operate on constants
                self.code_arith(OpCode::Len, e, &mut fake)
            }
        }
    }

    /// Prepare the first operand before the second is generated.
    pub fn infix(&mut self, op: BinOp, e: &mut ExpDesc) -> Result<(), CompileError> {
        match op {
            BinOp::And => self.go_if_true(e),
            BinOp::Or => self.go_if_false(e),
            BinOp::Concat => self.exp_to_next_reg(e), // operand must be on the stack
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
                if !e.is_numeral() {
                    self.exp_to_rk(e)?;
                }
                Ok(())
            }
            _ => {
                self.exp_to_rk(e)?;
                Ok(())
            }
        }
    }

    /// Combine both operands after the second is generated.
    pub fn posfix(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        match op {
            BinOp::And => {
                debug_assert!(e1.true_list == NO_JUMP); // closed by infix
                self.discharge_vars(e2)?;
                e2.false_list = self.concat(e2.false_list, e1.false_list)?;
                *e1 = *e2;
                Ok(())
            }
            BinOp::Or => {
                debug_assert!(e1.false_list == NO_JUMP); // closed by infix
                self.discharge_vars(e2)?;
                e2.true_list = self.concat(e2.true_list, e1.true_list)?;
                *e1 = *e2;
                Ok(())
            }
            BinOp::Concat => {
                self.exp_to_val(e2)?;
                if let ExpKind::Relocable { pc } = e2.kind {
                    if self.proto.code[pc].opcode() == OpCode::Concat {
                        // fold the new operand into the pending CONCAT range
                        let e1reg = match e1.kind {
                            ExpKind::NonReloc { register } => register,
                            _ => unreachable!(),
                        };
                        debug_assert!(e1reg == self.proto.code[pc].b() - 1);
                        self.free_exp(e1);
                        self.proto.code[pc].set_b(e1reg);
                        e1.kind = ExpKind::Relocable { pc };
                        return Ok(());
                    }
                }
                self.exp_to_next_reg(e2)?; // operand must be on the stack
                self.code_arith(OpCode::Concat, e1, e2)
            }
            BinOp::Add => self.code_arith(OpCode::Add, e1, e2),
            BinOp::Sub => self.code_arith(OpCode::Sub, e1, e2),
            BinOp::Mul => self.code_arith(OpCode::Mul, e1, e2),
            BinOp::Div => self.code_arith(OpCode::Div, e1, e2),
            BinOp::Mod => self.code_arith(OpCode::Mod, e1, e2),
            BinOp::Pow => self.code_arith(OpCode::Pow, e1, e2),
            BinOp::Eq => self.code_comp(OpCode::Eq, true, e1, e2),
            BinOp::NotEq => self.code_comp(OpCode::Eq, false, e1, e2),
            BinOp::Lt => self.code_comp(OpCode::Lt, true, e1, e2),
            BinOp::LtEq => self.code_comp(OpCode::Le, true, e1, e2),
            BinOp::Gt => self.code_comp(OpCode::Lt, false, e1, e2),
            BinOp::GtEq => self.code_comp(OpCode::Le, false, e1, e2),
        }
    }

    /// Move a batch of pending array values into the table at `base`.
    pub fn set_list(
        &mut self,
        base: u32,
        nelems: u32,
        tostore: i32,
    ) -> Result<(), CompileError> {
        let c = (nelems - 1) / FIELDS_PER_FLUSH + 1;
        let b = if tostore == MULTRET { 0 } else { tostore as u32 };
        debug_assert!(tostore != 0);
        if c <= MAX_C {
            self.code_abc(OpCode::SetList, base, b, c)?;
        } else {
            // the batch number does not fit in C: it goes in a raw
            // trailing word instead
            self.code_abc(OpCode::SetList, base, b, 0)?;
            self.code(Instruction::raw(c))?;
        }
        self.free_reg = base + 1; // free registers with list values
        Ok(())
    }
}

impl Default for FuncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Peephole constant folding: numeric arithmetic on jump-free number
/// literals. Division and modulo by zero are left for the runtime, `#` is
/// never folded, and NaN results are not produced.
fn const_fold(op: OpCode, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
    if !e1.is_numeral() || !e2.is_numeral() {
        return false;
    }
    let v1 = e1.number_value().unwrap();
    let v2 = e2.number_value().unwrap();
    let r = match op {
        OpCode::Add => v1 + v2,
        OpCode::Sub => v1 - v2,
        OpCode::Mul => v1 * v2,
        OpCode::Div => {
            if v2 == 0.0 {
                return false; // do not attempt to divide by 0
            }
            v1 / v2
        }
        OpCode::Mod => {
            if v2 == 0.0 {
                return false;
            }
            v1 - (v1 / v2).floor() * v2
        }
        OpCode::Pow => v1.powf(v2),
        OpCode::Unm => -v1,
        OpCode::Len => return false, // no constant folding for 'len'
        _ => unreachable!(),
    };
    if r.is_nan() {
        return false; // do not attempt to produce NaN
    }
    e1.kind = ExpKind::Number { value: r };
    true
}
