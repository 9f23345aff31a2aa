/// Expression descriptors: how a partially compiled expression is
/// currently represented.
use lunac_core::string::StringId;

/// Empty jump list / unpatched jump offset.
pub const NO_JUMP: i32 = -1;

/// Where an expression's value currently lives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExpKind {
    /// No value.
    Void,
    Nil,
    True,
    False,
    /// Constant at the given pool index.
    K { index: u32 },
    /// Number literal, not yet interned.
    Number { value: f64 },
    /// A named local's home register.
    Local { register: u32 },
    /// Captured variable.
    Upvalue { index: u32 },
    /// Unresolved global; the name is constants[name_k].
    Global { name_k: u32 },
    /// Pending `t[key]`: table register and RK-encoded key.
    Indexed { table: u32, key_rk: u32 },
    /// Result of a comparison: pc of its pending JMP.
    Jump { pc: i32 },
    /// Instruction at pc whose destination register is not yet decided.
    Relocable { pc: usize },
    /// Value fixed in a register.
    NonReloc { register: u32 },
    /// Open call at pc; result count still patchable.
    Call { pc: usize },
    /// Open vararg at pc; result count still patchable.
    Vararg { pc: usize },
}

/// An expression descriptor: a kind plus the patch lists of pending jumps
/// taken when the expression is true or false.
#[derive(Clone, Copy, Debug)]
pub struct ExpDesc {
    pub kind: ExpKind,
    pub true_list: i32,
    pub false_list: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> Self {
        ExpDesc {
            kind,
            true_list: NO_JUMP,
            false_list: NO_JUMP,
        }
    }

    pub fn void() -> Self {
        ExpDesc::new(ExpKind::Void)
    }

    pub fn number(value: f64) -> Self {
        ExpDesc::new(ExpKind::Number { value })
    }

    /// Any pending short-circuit jumps?
    pub fn has_jumps(&self) -> bool {
        self.true_list != self.false_list
    }

    /// A number literal with no pending jumps: foldable.
    pub fn is_numeral(&self) -> bool {
        matches!(self.kind, ExpKind::Number { .. })
            && self.true_list == NO_JUMP
            && self.false_list == NO_JUMP
    }

    /// An open call or vararg whose result count is still patchable.
    pub fn is_multi_ret(&self) -> bool {
        matches!(self.kind, ExpKind::Call { .. } | ExpKind::Vararg { .. })
    }

    pub fn number_value(&self) -> Option<f64> {
        match self.kind {
            ExpKind::Number { value } => Some(value),
            _ => None,
        }
    }
}

/// An upvalue captured by a function: either a parent local (captured from
/// the enclosing stack) or a parent upvalue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpvalDesc {
    pub name: StringId,
    /// Captured from the enclosing function's registers (true) or from its
    /// upvalues (false).
    pub in_stack: bool,
    pub index: u32,
}
