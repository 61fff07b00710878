use crate::vm::opcodes::BinOp;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    True,
    False,
    SelfRef,
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    Array(Vec<Expr>),
    /// Statements evaluated in order; the value is the last one's.
    Seq(Vec<Expr>),

    Local(String),
    Ivar(String),
    Const(String),
    AssignLocal(String, Box<Expr>),
    AssignIvar(String, Box<Expr>),
    AssignConst(String, Box<Expr>),
    /// `recv[index...] = value`
    IndexAssign {
        recv: Box<Expr>,
        index: Vec<Expr>,
        value: Box<Expr>,
    },

    Call(Call),
    Yield(Vec<Expr>),

    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),

    If {
        cond: Box<Expr>,
        then_body: Vec<Expr>,
        else_body: Vec<Expr>,
    },
    While {
        cond: Box<Expr>,
        body: Vec<Expr>,
    },
    Def {
        name: String,
        params: Vec<String>,
        body: Vec<Expr>,
    },
    Return(Option<Box<Expr>>),
    Break(Option<Box<Expr>>),
    Begin {
        body: Vec<Expr>,
        rescues: Vec<RescueClause>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub recv: Option<Box<Expr>>,
    pub name: String,
    pub args: Vec<Expr>,
    pub block: Option<BlockLiteral>,
    /// A bare identifier that was not a known local.
    pub vcall: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockLiteral {
    pub params: Vec<String>,
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RescueClause {
    pub classes: Vec<Expr>,
    pub var: Option<String>,
    pub body: Vec<Expr>,
}
