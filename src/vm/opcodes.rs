use std::rc::Rc;

use crate::vm::symbol::Sym;

/// How a `Send` names its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `recv.name(...)`: receiver is on the stack below the arguments.
    Call,
    /// `name(...)`: receiver is `self`.
    FCall,
    /// Bare `name` that might have been a variable; reported as NameError when missing.
    VCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Method name used when the operands have no built-in meaning.
    pub fn method_name(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OpCode {
    Nil,
    True,
    False,
    LoadSelf,
    LoadInt(i64),
    LoadFloat(f64),
    /// Allocates a fresh string each time it runs.
    LoadStr(Rc<str>),
    LoadSym(Sym),
    /// Load a local from the env `depth` block scopes out.
    GetLocal { depth: u16, index: u16 },
    /// Store top of stack into a local; the value stays on the stack.
    SetLocal { depth: u16, index: u16 },
    GetIvar(Sym),
    SetIvar(Sym),
    GetConst(Sym),
    SetConst(Sym),
    Pop,
    Dup,
    /// Pops N values and pushes a new array.
    Array(usize),
    Send {
        mid: Sym,
        argc: usize,
        /// Index into `Irep::children` of a literal block.
        block: Option<usize>,
        kind: CallKind,
    },
    /// Call the current frame's block with N arguments.
    Yield(usize),
    Binary(BinOp),
    Not,
    Neg,
    Jump(usize),
    /// Pops the condition.
    JumpIfFalse(usize),
    /// Define a method from a child irep on the current definition target.
    Def { mid: Sym, body: usize },
    /// Return from the current method (or from the top level).
    Return,
    /// `return` inside a block: unwinds to the enclosing method.
    ReturnFromBlock,
    /// `break` inside a block: unwinds to the call the block was passed to.
    Break,
    /// Install a rescue handler for this frame.
    PushHandler(usize),
    PopHandler,
    /// Pops N class values and pushes whether the pending exception is an
    /// instance of one of them (StandardError when N == 0).
    MatchException(usize),
    /// Raise the pending exception again.
    Reraise,
    /// Push the pending exception.
    GetException,
    ClearException,
}

/// Compiled instruction sequence of a program, method or block.
#[derive(Debug)]
pub struct Irep {
    pub name: String,
    pub code: Vec<OpCode>,
    /// Number of local slots, parameters first.
    pub nlocals: usize,
    /// Number of declared parameters.
    pub params: usize,
    pub children: Vec<Rc<Irep>>,
    pub is_block: bool,
}
