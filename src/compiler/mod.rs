//! Compiler from guest source text to `Irep` instruction sequences.

pub mod ast;
pub mod lexer;
pub mod parser;

use std::rc::Rc;

use thiserror::Error;

use crate::vm::opcodes::{CallKind, Irep, OpCode};
use crate::vm::symbol::SymbolTable;
use ast::{BlockLiteral, Call, Expr, RescueClause};
use lexer::Lexer;
use parser::Parser;

/// A syntax error with its 1-based source position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{col}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

/// Compile a whole program. Lexical errors are all reported; parsing stops
/// at the first syntax error.
pub fn compile(source: &str, symbols: &mut SymbolTable) -> Result<Rc<Irep>, Vec<ParseError>> {
    let (tokens, lex_errors) = Lexer::new(source).tokenize();
    if !lex_errors.is_empty() {
        return Err(lex_errors);
    }
    let program = Parser::new(tokens).parse_program().map_err(|e| vec![e])?;
    Ok(Codegen::new(symbols).generate(&program))
}

struct LoopContext {
    break_jumps: Vec<usize>,
    /// Rescue handlers open when the loop started.
    handler_depth: usize,
}

struct IrepBuilder {
    name: String,
    code: Vec<OpCode>,
    locals: Vec<String>,
    params: usize,
    children: Vec<Rc<Irep>>,
    is_block: bool,
    loops: Vec<LoopContext>,
    handler_depth: usize,
}

impl IrepBuilder {
    fn new(name: String, params: &[String], is_block: bool) -> Self {
        Self {
            name,
            code: Vec::new(),
            locals: params.to_vec(),
            params: params.len(),
            children: Vec::new(),
            is_block,
            loops: Vec::new(),
            handler_depth: 0,
        }
    }

    fn finish(self) -> Rc<Irep> {
        Rc::new(Irep {
            name: self.name,
            code: self.code,
            nlocals: self.locals.len(),
            params: self.params,
            children: self.children,
            is_block: self.is_block,
        })
    }
}

pub struct Codegen<'a> {
    symbols: &'a mut SymbolTable,
    builders: Vec<IrepBuilder>,
}

impl<'a> Codegen<'a> {
    pub fn new(symbols: &'a mut SymbolTable) -> Self {
        Self {
            symbols,
            builders: Vec::new(),
        }
    }

    pub fn generate(mut self, program: &[Expr]) -> Rc<Irep> {
        self.builders.push(IrepBuilder::new("<main>".into(), &[], false));
        self.gen_body(program);
        self.emit(OpCode::Return);
        match self.builders.pop() {
            Some(builder) => builder.finish(),
            None => IrepBuilder::new("<main>".into(), &[], false).finish(),
        }
    }

    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn builder(&mut self) -> &mut IrepBuilder {
        let last = self.builders.len() - 1;
        &mut self.builders[last]
    }

    fn emit(&mut self, op: OpCode) -> usize {
        let code = &mut self.builder().code;
        code.push(op);
        code.len() - 1
    }

    fn here(&mut self) -> usize {
        self.builder().code.len()
    }

    /// Point the jump at `at` to the current position.
    fn patch(&mut self, at: usize) {
        let target = self.here();
        match &mut self.builder().code[at] {
            OpCode::Jump(t) | OpCode::JumpIfFalse(t) | OpCode::PushHandler(t) => *t = target,
            _ => {}
        }
    }

    /// Find a local in the current method scope. Block scopes see the
    /// locals of the scopes around them.
    fn resolve(&self, name: &str) -> Option<(u16, u16)> {
        for (depth, builder) in self.builders.iter().rev().enumerate() {
            if let Some(index) = builder.locals.iter().position(|l| l == name) {
                return Some((depth as u16, index as u16));
            }
            if !builder.is_block {
                break;
            }
        }
        None
    }

    fn resolve_or_declare(&mut self, name: &str) -> (u16, u16) {
        if let Some(slot) = self.resolve(name) {
            return slot;
        }
        let locals = &mut self.builder().locals;
        locals.push(name.to_string());
        (0, (locals.len() - 1) as u16)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Statements leaving exactly one value (the last one's, or nil).
    fn gen_body(&mut self, stmts: &[Expr]) {
        if stmts.is_empty() {
            self.emit(OpCode::Nil);
            return;
        }
        for (i, stmt) in stmts.iter().enumerate() {
            self.gen_expr(stmt);
            if i + 1 < stmts.len() {
                self.emit(OpCode::Pop);
            }
        }
    }

    fn gen_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Nil => {
                self.emit(OpCode::Nil);
            }
            Expr::True => {
                self.emit(OpCode::True);
            }
            Expr::False => {
                self.emit(OpCode::False);
            }
            Expr::SelfRef => {
                self.emit(OpCode::LoadSelf);
            }
            Expr::Int(n) => {
                self.emit(OpCode::LoadInt(*n));
            }
            Expr::Float(f) => {
                self.emit(OpCode::LoadFloat(*f));
            }
            Expr::Str(s) => {
                self.emit(OpCode::LoadStr(Rc::from(s.as_str())));
            }
            Expr::Sym(s) => {
                let sym = self.symbols.intern(s);
                self.emit(OpCode::LoadSym(sym));
            }
            Expr::Array(items) => {
                for item in items {
                    self.gen_expr(item);
                }
                self.emit(OpCode::Array(items.len()));
            }
            Expr::Seq(stmts) => self.gen_body(stmts),

            Expr::Local(name) => {
                let (depth, index) = self.resolve_or_declare(name);
                self.emit(OpCode::GetLocal { depth, index });
            }
            Expr::Ivar(name) => {
                let sym = self.symbols.intern(name);
                self.emit(OpCode::GetIvar(sym));
            }
            Expr::Const(name) => {
                let sym = self.symbols.intern(name);
                self.emit(OpCode::GetConst(sym));
            }
            Expr::AssignLocal(name, value) => {
                // Declared before the value so `x = x` reads nil.
                let (depth, index) = self.resolve_or_declare(name);
                self.gen_expr(value);
                self.emit(OpCode::SetLocal { depth, index });
            }
            Expr::AssignIvar(name, value) => {
                self.gen_expr(value);
                let sym = self.symbols.intern(name);
                self.emit(OpCode::SetIvar(sym));
            }
            Expr::AssignConst(name, value) => {
                self.gen_expr(value);
                let sym = self.symbols.intern(name);
                self.emit(OpCode::SetConst(sym));
            }
            Expr::IndexAssign { recv, index, value } => {
                self.gen_expr(recv);
                for arg in index {
                    self.gen_expr(arg);
                }
                self.gen_expr(value);
                let mid = self.symbols.intern("[]=");
                self.emit(OpCode::Send {
                    mid,
                    argc: index.len() + 1,
                    block: None,
                    kind: CallKind::Call,
                });
            }

            Expr::Call(call) => self.gen_call(call),
            Expr::Yield(args) => {
                for arg in args {
                    self.gen_expr(arg);
                }
                self.emit(OpCode::Yield(args.len()));
            }

            Expr::Binary(op, lhs, rhs) => {
                self.gen_expr(lhs);
                self.gen_expr(rhs);
                self.emit(OpCode::Binary(*op));
            }
            Expr::And(lhs, rhs) => {
                self.gen_expr(lhs);
                self.emit(OpCode::Dup);
                let skip = self.emit(OpCode::JumpIfFalse(0));
                self.emit(OpCode::Pop);
                self.gen_expr(rhs);
                self.patch(skip);
            }
            Expr::Or(lhs, rhs) => {
                self.gen_expr(lhs);
                self.emit(OpCode::Dup);
                let to_rhs = self.emit(OpCode::JumpIfFalse(0));
                let done = self.emit(OpCode::Jump(0));
                self.patch(to_rhs);
                self.emit(OpCode::Pop);
                self.gen_expr(rhs);
                self.patch(done);
            }
            Expr::Not(operand) => {
                self.gen_expr(operand);
                self.emit(OpCode::Not);
            }
            Expr::Neg(operand) => {
                self.gen_expr(operand);
                self.emit(OpCode::Neg);
            }

            Expr::If {
                cond,
                then_body,
                else_body,
            } => {
                self.gen_expr(cond);
                let to_else = self.emit(OpCode::JumpIfFalse(0));
                self.gen_body(then_body);
                let to_end = self.emit(OpCode::Jump(0));
                self.patch(to_else);
                self.gen_body(else_body);
                self.patch(to_end);
            }
            Expr::While { cond, body } => self.gen_while(cond, body),
            Expr::Def { name, params, body } => self.gen_def(name, params, body),
            Expr::Return(value) => {
                self.gen_opt(value.as_deref());
                let in_block = self.builders.last().is_some_and(|b| b.is_block);
                self.emit(if in_block {
                    OpCode::ReturnFromBlock
                } else {
                    OpCode::Return
                });
            }
            Expr::Break(value) => self.gen_break(value.as_deref()),
            Expr::Begin { body, rescues } => self.gen_begin(body, rescues),
        }
    }

    fn gen_opt(&mut self, value: Option<&Expr>) {
        match value {
            Some(v) => self.gen_expr(v),
            None => {
                self.emit(OpCode::Nil);
            }
        }
    }

    fn gen_call(&mut self, call: &Call) {
        let kind = match (&call.recv, call.vcall) {
            (Some(recv), _) => {
                self.gen_expr(recv);
                CallKind::Call
            }
            (None, true) => CallKind::VCall,
            (None, false) => CallKind::FCall,
        };
        for arg in &call.args {
            self.gen_expr(arg);
        }
        let block = call
            .block
            .as_ref()
            .map(|block| self.gen_block(&call.name, block));
        let mid = self.symbols.intern(&call.name);
        self.emit(OpCode::Send {
            mid,
            argc: call.args.len(),
            block,
            kind,
        });
    }

    /// Compile a block literal as a child irep; returns its child index.
    fn gen_block(&mut self, method: &str, block: &BlockLiteral) -> usize {
        self.builders
            .push(IrepBuilder::new(format!("block in {}", method), &block.params, true));
        self.gen_body(&block.body);
        self.emit(OpCode::Return);
        self.finish_child()
    }

    fn finish_child(&mut self) -> usize {
        let Some(child) = self.builders.pop() else {
            return 0;
        };
        let irep = child.finish();
        let children = &mut self.builder().children;
        children.push(irep);
        children.len() - 1
    }

    fn gen_def(&mut self, name: &str, params: &[String], body: &[Expr]) {
        self.builders.push(IrepBuilder::new(name.to_string(), params, false));
        self.gen_body(body);
        self.emit(OpCode::Return);
        let index = self.finish_child();
        let mid = self.symbols.intern(name);
        self.emit(OpCode::Def { mid, body: index });
    }

    fn gen_while(&mut self, cond: &Expr, body: &[Expr]) {
        let start = self.here();
        self.gen_expr(cond);
        let exit = self.emit(OpCode::JumpIfFalse(0));
        let handler_depth = self.builder().handler_depth;
        self.builder().loops.push(LoopContext {
            break_jumps: Vec::new(),
            handler_depth,
        });
        self.gen_body(body);
        self.emit(OpCode::Pop);
        self.emit(OpCode::Jump(start));
        self.patch(exit);
        if let Some(ctx) = self.builder().loops.pop() {
            for jump in ctx.break_jumps {
                self.patch(jump);
            }
        }
        self.emit(OpCode::Nil);
    }

    fn gen_break(&mut self, value: Option<&Expr>) {
        self.gen_opt(value);
        let open_handlers = {
            let builder = self.builder();
            builder
                .loops
                .last()
                .map(|ctx| builder.handler_depth - ctx.handler_depth)
        };
        match open_handlers {
            // `break` in a while loop: a plain jump past the loop, which
            // yields nil.
            Some(open) => {
                self.emit(OpCode::Pop);
                for _ in 0..open {
                    self.emit(OpCode::PopHandler);
                }
                let jump = self.emit(OpCode::Jump(0));
                if let Some(ctx) = self.builder().loops.last_mut() {
                    ctx.break_jumps.push(jump);
                }
            }
            None => {
                self.emit(OpCode::Break);
            }
        }
    }

    fn gen_begin(&mut self, body: &[Expr], rescues: &[RescueClause]) {
        let handler = self.emit(OpCode::PushHandler(0));
        self.builder().handler_depth += 1;
        self.gen_body(body);
        self.builder().handler_depth -= 1;
        self.emit(OpCode::PopHandler);
        let mut to_end = vec![self.emit(OpCode::Jump(0))];

        self.patch(handler);
        for clause in rescues {
            for class in &clause.classes {
                self.gen_expr(class);
            }
            self.emit(OpCode::MatchException(clause.classes.len()));
            let next = self.emit(OpCode::JumpIfFalse(0));
            if let Some(var) = &clause.var {
                let (depth, index) = self.resolve_or_declare(var);
                self.emit(OpCode::GetException);
                self.emit(OpCode::SetLocal { depth, index });
                self.emit(OpCode::Pop);
            }
            self.emit(OpCode::ClearException);
            self.gen_body(&clause.body);
            to_end.push(self.emit(OpCode::Jump(0)));
            self.patch(next);
        }
        self.emit(OpCode::Reraise);
        for jump in to_end {
            self.patch(jump);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> Rc<Irep> {
        let mut symbols = SymbolTable::new();
        compile(src, &mut symbols).expect("compile")
    }

    #[test]
    fn test_locals_are_allocated_per_scope() {
        let irep = compile_ok("a = 1\nb = 2\n[1].each { |x| c = a + x }");
        assert_eq!(irep.nlocals, 2);
        let block = &irep.children[0];
        assert!(block.is_block);
        assert_eq!(block.params, 1);
        assert_eq!(block.nlocals, 2);
        assert!(block.code.iter().any(|op| matches!(op, OpCode::GetLocal { depth: 1, index: 0 })));
    }

    #[test]
    fn test_def_compiles_to_child_irep() {
        let irep = compile_ok("def add(a, b)\n  a + b\nend");
        assert!(matches!(irep.code[0], OpCode::Def { body: 0, .. }));
        let method = &irep.children[0];
        assert_eq!(method.name, "add");
        assert_eq!(method.params, 2);
        assert!(!method.is_block);
    }

    #[test]
    fn test_return_inside_block_unwinds_to_method() {
        let irep = compile_ok("def f\n  [1].each { |x| return x }\nend");
        let block = &irep.children[0].children[0];
        assert!(block.code.iter().any(|op| matches!(op, OpCode::ReturnFromBlock)));
    }

    #[test]
    fn test_break_in_rescued_while_body_pops_handler() {
        let irep = compile_ok("while true\n  begin\n    break\n  rescue\n  end\nend");
        let pop = irep
            .code
            .iter()
            .position(|op| matches!(op, OpCode::PopHandler))
            .expect("break pops the open handler");
        assert!(matches!(irep.code[pop + 1], OpCode::Jump(_)));
    }

    #[test]
    fn test_syntax_error_is_returned() {
        let mut symbols = SymbolTable::new();
        let errors = compile("1 +", &mut symbols).expect_err("incomplete expression");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[0].to_string(), "1:4: syntax error, unexpected end-of-input");
    }
}
