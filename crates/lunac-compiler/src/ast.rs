/// Abstract syntax tree for Lua 5.1 chunks.
///
/// Every node records the line of its defining token; the code generator
/// stamps emitted instructions with these lines.
use lunac_core::string::StringId;

/// An identifier occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Name {
    pub id: StringId,
    pub line: u32,
}

/// A sequence of statements.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub stats: Vec<Stat>,
}

/// The dotted/method path of a `function` statement:
/// `function base.field1.field2:method(...)`.
#[derive(Clone, Debug)]
pub struct FuncName {
    pub base: Name,
    pub fields: Vec<Name>,
    pub method: Option<Name>,
}

/// A function literal body.
#[derive(Clone, Debug)]
pub struct FuncBody {
    pub params: Vec<Name>,
    pub is_vararg: bool,
    pub body: Block,
    /// Line of the `function` keyword.
    pub line: u32,
    /// Line of the matching `end`.
    pub end_line: u32,
}

#[derive(Clone, Debug)]
pub enum Stat {
    /// `local n1, n2 = e1, e2`
    Local {
        names: Vec<Name>,
        exprs: Vec<Expr>,
        line: u32,
    },
    /// `local function name(...) ... end`
    LocalFunction { name: Name, body: FuncBody },
    /// `v1, v2 = e1, e2`
    Assign {
        targets: Vec<Expr>,
        exprs: Vec<Expr>,
        line: u32,
    },
    /// A call in statement position.
    Call { expr: Expr },
    Do { body: Block },
    While {
        cond: Expr,
        body: Block,
        line: u32,
    },
    Repeat {
        body: Block,
        cond: Expr,
        line: u32,
    },
    If {
        /// `(condition, body)` for `if` and each `elseif`.
        arms: Vec<(Expr, Block)>,
        else_body: Option<Block>,
        line: u32,
    },
    NumericFor {
        var: Name,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
        line: u32,
    },
    GenericFor {
        names: Vec<Name>,
        exprs: Vec<Expr>,
        body: Block,
        line: u32,
    },
    /// `function a.b:c(...) ... end`
    Function { name: FuncName, body: FuncBody },
    Return { exprs: Vec<Expr>, line: u32 },
    Break { line: u32 },
}

#[derive(Clone, Debug)]
pub enum Expr {
    Nil { line: u32 },
    True { line: u32 },
    False { line: u32 },
    Number { value: f64, line: u32 },
    Str { id: StringId, line: u32 },
    Vararg { line: u32 },
    Function(Box<FuncBody>),
    Name(Name),
    /// `obj[key]`; `obj.field` carries the field name as a string key.
    Index {
        obj: Box<Expr>,
        key: Box<Expr>,
        line: u32,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        line: u32,
    },
    MethodCall {
        obj: Box<Expr>,
        method: Name,
        args: Vec<Expr>,
        line: u32,
    },
    Table {
        fields: Vec<TableField>,
        line: u32,
    },
    BinOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: u32,
    },
    UnOp {
        op: UnOp,
        operand: Box<Expr>,
        line: u32,
    },
    /// A parenthesized expression: truncates multiple results to one.
    Paren(Box<Expr>),
}

impl Expr {
    /// Whether this expression can produce multiple values.
    pub fn is_multi_ret(&self) -> bool {
        matches!(
            self,
            Expr::Call { .. } | Expr::MethodCall { .. } | Expr::Vararg { .. }
        )
    }

    pub fn line(&self) -> u32 {
        match self {
            Expr::Nil { line }
            | Expr::True { line }
            | Expr::False { line }
            | Expr::Number { line, .. }
            | Expr::Str { line, .. }
            | Expr::Vararg { line }
            | Expr::Index { line, .. }
            | Expr::Call { line, .. }
            | Expr::MethodCall { line, .. }
            | Expr::Table { line, .. }
            | Expr::BinOp { line, .. }
            | Expr::UnOp { line, .. } => *line,
            Expr::Function(body) => body.line,
            Expr::Name(name) => name.line,
            Expr::Paren(inner) => inner.line(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum TableField {
    /// A positional array item.
    Item(Expr),
    /// `[key] = value` (with `name = value` normalized to a string key).
    Pair(Expr, Expr),
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinOp {
    /// `(left, right)` binding priorities; right < left means
    /// right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => (3, 3),
            BinOp::Concat => (5, 4), // right-associative
            BinOp::Add | BinOp::Sub => (6, 6),
            BinOp::Mul | BinOp::Div | BinOp::Mod => (7, 7),
            BinOp::Pow => (10, 9), // right-associative
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq
        )
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

/// Priority of all unary operators.
pub const UNARY_PRIORITY: u8 = 8;
