//! Recursive-descent parser.
//!
//! Locals are resolved while parsing, the way Ruby does it: an identifier is
//! a variable read only if an assignment to it has already been seen in the
//! current method scope (or an enclosing block's). Anything else is a method
//! call on `self`.

use std::collections::HashSet;
use std::mem::discriminant;

use super::ParseError;
use super::ast::{BlockLiteral, Call, Expr, RescueClause};
use super::lexer::{Token, TokenKind};
use crate::vm::opcodes::BinOp;

type PResult<T> = Result<T, ParseError>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Top,
    Method,
    Block,
}

struct Scope {
    kind: ScopeKind,
    locals: HashSet<String>,
    /// Open `while` loops in this scope.
    loop_depth: usize,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            locals: HashSet::new(),
            loop_depth: 0,
        }
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    scopes: Vec<Scope>,
    /// Non-zero while `do` must not start a block (command arguments and loop
    /// conditions).
    no_do: usize,
    /// Active recursive descents.
    nesting: usize,
    /// Upper bound on the height of the tree under construction. Left-leaning
    /// chains (`a + b + c`, `a.b.c`) add to it without recursing.
    height: usize,
}

/// Deepest recursive descent accepted (brackets, blocks, conditionals).
const MAX_NESTING: usize = 128;
/// Tallest expression tree accepted. Code generation recurses over the tree,
/// so this bounds it as well.
const MAX_HEIGHT: usize = 512;

enum AssignTarget {
    Local(String),
    Ivar(String),
    Const(String),
    Index { recv: Box<Expr>, index: Vec<Expr> },
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            scopes: vec![Scope::new(ScopeKind::Top)],
            no_do: 0,
            nesting: 0,
            height: 0,
        }
    }

    pub fn parse_program(mut self) -> PResult<Vec<Expr>> {
        let stmts = self.parse_stmts(&[])?;
        if !self.check(&TokenKind::Eof) {
            return Err(self.unexpected());
        }
        Ok(stmts)
    }

    // =========================================================================
    // Token helpers
    // =========================================================================

    fn peek(&self) -> &Token {
        // The token list always ends with Eof.
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        discriminant(self.kind()) == discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected_expecting(kind))
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_terms(&mut self) {
        while matches!(self.kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.nesting += 1;
        self.grow()
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    fn grow(&mut self) -> PResult<()> {
        self.height += 1;
        if self.nesting > MAX_NESTING || self.height > MAX_HEIGHT {
            return Err(self.error_at(self.peek(), "nesting too deep"));
        }
        Ok(())
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> ParseError {
        ParseError {
            line: token.line,
            col: token.col,
            message: message.into(),
        }
    }

    fn unexpected(&self) -> ParseError {
        let token = self.peek();
        self.error_at(token, format!("syntax error, unexpected {}", describe(&token.kind)))
    }

    fn unexpected_expecting(&self, expected: &TokenKind) -> ParseError {
        let token = self.peek();
        self.error_at(
            token,
            format!(
                "syntax error, unexpected {}, expecting {}",
                describe(&token.kind),
                describe(expected)
            ),
        )
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    fn scope(&mut self) -> &mut Scope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn is_local(&self, name: &str) -> bool {
        for scope in self.scopes.iter().rev() {
            if scope.locals.contains(name) {
                return true;
            }
            if scope.kind != ScopeKind::Block {
                break;
            }
        }
        false
    }

    fn declare(&mut self, name: &str) {
        if !self.is_local(name) {
            self.scope().locals.insert(name.to_string());
        }
    }

    fn break_allowed(&self) -> bool {
        self.scopes
            .last()
            .is_some_and(|s| s.loop_depth > 0 || s.kind == ScopeKind::Block)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Parse statements up to (not including) one of `terminators` or Eof.
    fn parse_stmts(&mut self, terminators: &[TokenKind]) -> PResult<Vec<Expr>> {
        let mut stmts = Vec::new();
        let base = self.height;
        let mut tallest = base;
        loop {
            self.skip_terms();
            if self.check(&TokenKind::Eof) || terminators.iter().any(|t| self.check(t)) {
                break;
            }
            self.height = base;
            stmts.push(self.parse_stmt()?);
            tallest = tallest.max(self.height);
            let at_end = matches!(
                self.kind(),
                TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof
            ) || terminators.iter().any(|t| self.check(t));
            if !at_end {
                return Err(self.unexpected());
            }
        }
        self.height = tallest;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_expr()?;
        loop {
            if matches!(self.kind(), TokenKind::If | TokenKind::Unless | TokenKind::While) {
                self.grow()?;
            }
            match self.kind() {
                TokenKind::If => {
                    self.advance();
                    let cond = self.parse_expr()?;
                    expr = Expr::If {
                        cond: Box::new(cond),
                        then_body: vec![expr],
                        else_body: Vec::new(),
                    };
                }
                TokenKind::Unless => {
                    self.advance();
                    let cond = self.parse_expr()?;
                    expr = Expr::If {
                        cond: Box::new(cond),
                        then_body: Vec::new(),
                        else_body: vec![expr],
                    };
                }
                TokenKind::While => {
                    self.advance();
                    let cond = self.parse_expr()?;
                    expr = Expr::While {
                        cond: Box::new(cond),
                        body: vec![expr],
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.parse_assignment();
        self.leave();
        expr
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        let lhs = self.parse_or()?;
        let op = match self.kind() {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinOp::Add),
            TokenKind::MinusAssign => Some(BinOp::Sub),
            TokenKind::StarAssign => Some(BinOp::Mul),
            _ => return Ok(lhs),
        };
        let op_token = self.advance();
        self.skip_newlines();

        let target = match lhs {
            Expr::Local(name) => AssignTarget::Local(name),
            Expr::Ivar(name) => AssignTarget::Ivar(name),
            Expr::Const(name) => AssignTarget::Const(name),
            Expr::Call(call) if call.vcall => AssignTarget::Local(call.name),
            Expr::Call(Call {
                recv: Some(recv),
                name,
                args,
                block: None,
                ..
            }) if name == "[]" && op.is_none() => AssignTarget::Index { recv, index: args },
            _ => return Err(self.error_at(&op_token, "syntax error, unexpected '=', cannot assign here")),
        };
        if let AssignTarget::Local(name) = &target {
            self.declare(name);
        }

        let rhs = self.parse_expr()?;
        let value = match op {
            None => rhs,
            Some(op) => {
                let current = match &target {
                    AssignTarget::Local(name) => Expr::Local(name.clone()),
                    AssignTarget::Ivar(name) => Expr::Ivar(name.clone()),
                    AssignTarget::Const(name) => Expr::Const(name.clone()),
                    AssignTarget::Index { .. } => {
                        return Err(self.error_at(&op_token, "operator assignment to an index is not supported"));
                    }
                };
                Expr::Binary(op, Box::new(current), Box::new(rhs))
            }
        };

        Ok(match target {
            AssignTarget::Local(name) => Expr::AssignLocal(name, Box::new(value)),
            AssignTarget::Ivar(name) => Expr::AssignIvar(name, Box::new(value)),
            AssignTarget::Const(name) => Expr::AssignConst(name, Box::new(value)),
            AssignTarget::Index { recv, index } => Expr::IndexAssign {
                recv,
                index,
                value: Box::new(value),
            },
        })
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat(&TokenKind::OrOr) {
            self.grow()?;
            self.skip_newlines();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&TokenKind::AndAnd) {
            self.grow()?;
            self.skip_newlines();
            let rhs = self.parse_equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_binary_level(
        &mut self,
        ops: &[(TokenKind, BinOp)],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.check(kind) {
                    self.advance();
                    self.grow()?;
                    self.skip_newlines();
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[(TokenKind::EqEq, BinOp::Eq), (TokenKind::NotEq, BinOp::Ne)],
            Self::parse_comparison,
        )
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[
                (TokenKind::Lt, BinOp::Lt),
                (TokenKind::Le, BinOp::Le),
                (TokenKind::Gt, BinOp::Gt),
                (TokenKind::Ge, BinOp::Ge),
            ],
            Self::parse_shift,
        )
    }

    /// `<<` is an ordinary method call (`Array#<<`).
    fn parse_shift(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_additive()?;
        while self.eat(&TokenKind::Shl) {
            self.grow()?;
            self.skip_newlines();
            let rhs = self.parse_additive()?;
            lhs = Expr::Call(Call {
                recv: Some(Box::new(lhs)),
                name: "<<".into(),
                args: vec![rhs],
                block: None,
                vcall: false,
            });
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[
                (TokenKind::Star, BinOp::Mul),
                (TokenKind::Slash, BinOp::Div),
                (TokenKind::Percent, BinOp::Mod),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        match self.kind() {
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_nested_unary()?;
                Ok(Expr::Not(Box::new(operand)))
            }
            TokenKind::Minus => {
                self.advance();
                // `-2.abs` is `(-2).abs`: a minus glued to a literal is part of it.
                let glued = !self.peek().space_before;
                match self.kind().clone() {
                    TokenKind::Int(n) if glued => {
                        self.advance();
                        self.parse_postfix_ops(Expr::Int(-n))
                    }
                    TokenKind::Float(f) if glued => {
                        self.advance();
                        self.parse_postfix_ops(Expr::Float(-f))
                    }
                    _ => {
                        let operand = self.parse_nested_unary()?;
                        Ok(Expr::Neg(Box::new(operand)))
                    }
                }
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix_ops(primary)
            }
        }
    }

    fn parse_nested_unary(&mut self) -> PResult<Expr> {
        self.enter()?;
        let operand = self.parse_unary();
        self.leave();
        operand
    }

    fn parse_postfix_ops(&mut self, mut expr: Expr) -> PResult<Expr> {
        loop {
            match self.kind() {
                TokenKind::Dot => {
                    self.advance();
                    self.grow()?;
                    self.skip_newlines();
                    let token = self.advance();
                    let name = match token.kind {
                        TokenKind::Ident(name) | TokenKind::Const(name) => name,
                        _ => return Err(self.error_at(&token, format!("syntax error, unexpected {}", describe(&token.kind)))),
                    };
                    expr = self.parse_call_rest(Some(expr), name, false)?;
                }
                TokenKind::LBracket => {
                    self.advance();
                    self.grow()?;
                    let args = self.parse_list(&TokenKind::RBracket)?;
                    expr = Expr::Call(Call {
                        recv: Some(Box::new(expr)),
                        name: "[]".into(),
                        args,
                        block: None,
                        vcall: false,
                    });
                }
                TokenKind::Newline => {
                    // Leading-dot method chains continue on the next line.
                    let mut offset = 0;
                    while self.peek_at(offset).is_some_and(|t| t.kind == TokenKind::Newline) {
                        offset += 1;
                    }
                    if self.peek_at(offset).is_some_and(|t| t.kind == TokenKind::Dot) {
                        self.skip_newlines();
                    } else {
                        return Ok(expr);
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Comma-separated expressions up to `close`, which is consumed.
    fn parse_list(&mut self, close: &TokenKind) -> PResult<Vec<Expr>> {
        let saved = std::mem::take(&mut self.no_do);
        let mut items = Vec::new();
        let base = self.height;
        let mut tallest = base;
        self.skip_newlines();
        while !self.check(close) {
            self.height = base;
            items.push(self.parse_expr()?);
            tallest = tallest.max(self.height);
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.no_do = saved;
        self.height = tallest;
        self.expect(close)?;
        Ok(items)
    }

    fn can_start_command_arg(&self) -> bool {
        let token = self.peek();
        if !token.space_before {
            return false;
        }
        let glued_next = self.peek_at(1).is_some_and(|t| !t.space_before);
        match token.kind {
            TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::Symbol(_)
            | TokenKind::Ident(_)
            | TokenKind::Const(_)
            | TokenKind::Ivar(_)
            | TokenKind::Nil
            | TokenKind::True
            | TokenKind::False
            | TokenKind::SelfKw
            | TokenKind::Yield
            | TokenKind::Bang
            | TokenKind::LParen => true,
            TokenKind::Minus | TokenKind::LBracket => glued_next,
            _ => false,
        }
    }

    fn can_start_value(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::Int(_)
                | TokenKind::Float(_)
                | TokenKind::Str(_)
                | TokenKind::Symbol(_)
                | TokenKind::Ident(_)
                | TokenKind::Const(_)
                | TokenKind::Ivar(_)
                | TokenKind::Nil
                | TokenKind::True
                | TokenKind::False
                | TokenKind::SelfKw
                | TokenKind::Yield
                | TokenKind::Bang
                | TokenKind::Minus
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::Begin
        )
    }

    /// Arguments and block after a method name.
    fn parse_call_rest(&mut self, recv: Option<Expr>, name: String, vcall_candidate: bool) -> PResult<Expr> {
        let mut args = Vec::new();
        let mut has_parens = false;
        if self.check(&TokenKind::LParen) && !self.peek().space_before {
            self.advance();
            args = self.parse_list(&TokenKind::RParen)?;
            has_parens = true;
        } else if self.can_start_command_arg() {
            args = self.parse_command_args()?;
        }
        let block = self.parse_block_opt()?;
        let vcall = vcall_candidate && !has_parens && args.is_empty() && block.is_none();
        Ok(Expr::Call(Call {
            recv: recv.map(Box::new),
            name,
            args,
            block,
            vcall,
        }))
    }

    fn parse_command_args(&mut self) -> PResult<Vec<Expr>> {
        self.no_do += 1;
        let mut args = Vec::new();
        let base = self.height;
        let mut tallest = base;
        loop {
            self.height = base;
            args.push(self.parse_expr()?);
            tallest = tallest.max(self.height);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.no_do -= 1;
        self.height = tallest;
        Ok(args)
    }

    fn parse_block_opt(&mut self) -> PResult<Option<BlockLiteral>> {
        if self.check(&TokenKind::LBrace) {
            self.parse_block(&TokenKind::RBrace).map(Some)
        } else if self.check(&TokenKind::Do) && self.no_do == 0 {
            self.parse_block(&TokenKind::End).map(Some)
        } else {
            Ok(None)
        }
    }

    fn parse_block(&mut self, close: &TokenKind) -> PResult<BlockLiteral> {
        self.advance();
        let saved = std::mem::take(&mut self.no_do);
        self.scopes.push(Scope::new(ScopeKind::Block));
        let mut params = Vec::new();
        self.skip_newlines();
        if self.eat(&TokenKind::Pipe) {
            while !self.check(&TokenKind::Pipe) {
                let token = self.advance();
                match token.kind {
                    TokenKind::Ident(name) => {
                        self.scope().locals.insert(name.clone());
                        params.push(name);
                    }
                    ref other => {
                        return Err(self.error_at(&token, format!("syntax error, unexpected {}", describe(other))));
                    }
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::Pipe)?;
        }
        let body = self.parse_stmts(std::slice::from_ref(close))?;
        self.expect(close)?;
        self.scopes.pop();
        self.no_do = saved;
        Ok(BlockLiteral { params, body })
    }

    // =========================================================================
    // Primaries
    // =========================================================================

    fn parse_primary(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr::Int(n))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::Float(f))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            TokenKind::Symbol(s) => {
                self.advance();
                Ok(Expr::Sym(s))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::Nil)
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::True)
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::False)
            }
            TokenKind::SelfKw => {
                self.advance();
                Ok(Expr::SelfRef)
            }
            TokenKind::Ivar(name) => {
                self.advance();
                Ok(Expr::Ivar(name))
            }
            TokenKind::Const(name) => {
                self.advance();
                Ok(Expr::Const(name))
            }
            TokenKind::Ident(name) => {
                self.advance();
                let paren_call = self.check(&TokenKind::LParen) && !self.peek().space_before;
                if self.is_local(&name) && !paren_call {
                    Ok(Expr::Local(name))
                } else {
                    self.parse_call_rest(None, name, true)
                }
            }
            TokenKind::LBracket => {
                self.advance();
                Ok(Expr::Array(self.parse_list(&TokenKind::RBracket)?))
            }
            TokenKind::LParen => {
                self.advance();
                let saved = std::mem::take(&mut self.no_do);
                let mut stmts = self.parse_stmts(&[TokenKind::RParen])?;
                self.no_do = saved;
                self.expect(&TokenKind::RParen)?;
                Ok(match stmts.len() {
                    0 => Expr::Nil,
                    1 => stmts.remove(0),
                    _ => Expr::Seq(stmts),
                })
            }
            TokenKind::If => {
                self.advance();
                let expr = self.parse_if_rest()?;
                self.expect(&TokenKind::End)?;
                Ok(expr)
            }
            TokenKind::Unless => self.parse_unless(),
            TokenKind::While => self.parse_while(),
            TokenKind::Def => self.parse_def(),
            TokenKind::Begin => {
                self.advance();
                let body = self.parse_body_with_rescue()?;
                self.expect(&TokenKind::End)?;
                Ok(match <[Expr; 1]>::try_from(body) {
                    Ok([single]) => single,
                    Err(body) => Expr::Seq(body),
                })
            }
            TokenKind::Yield => {
                self.advance();
                let args = if self.check(&TokenKind::LParen) && !self.peek().space_before {
                    self.advance();
                    self.parse_list(&TokenKind::RParen)?
                } else if self.can_start_command_arg() {
                    self.parse_command_args()?
                } else {
                    Vec::new()
                };
                Ok(Expr::Yield(args))
            }
            TokenKind::Return => {
                self.advance();
                let value = self.parse_jump_value()?;
                Ok(Expr::Return(value))
            }
            TokenKind::Break => {
                if !self.break_allowed() {
                    return Err(self.error_at(&token, "Invalid break"));
                }
                self.advance();
                let value = self.parse_jump_value()?;
                Ok(Expr::Break(value))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_jump_value(&mut self) -> PResult<Option<Box<Expr>>> {
        if self.can_start_value() {
            Ok(Some(Box::new(self.parse_expr()?)))
        } else {
            Ok(None)
        }
    }

    /// After `if` or `elsif`; the closing `end` is left to the caller.
    fn parse_if_rest(&mut self) -> PResult<Expr> {
        self.no_do += 1;
        let cond = self.parse_expr()?;
        self.no_do -= 1;
        self.eat(&TokenKind::Then);
        let then_body = self.parse_stmts(&[TokenKind::Elsif, TokenKind::Else, TokenKind::End])?;
        let else_body = match self.kind() {
            TokenKind::Elsif => {
                self.advance();
                self.enter()?;
                let rest = self.parse_if_rest()?;
                self.leave();
                vec![rest]
            }
            TokenKind::Else => {
                self.advance();
                self.parse_stmts(&[TokenKind::End])?
            }
            _ => Vec::new(),
        };
        Ok(Expr::If {
            cond: Box::new(cond),
            then_body,
            else_body,
        })
    }

    fn parse_unless(&mut self) -> PResult<Expr> {
        self.advance();
        self.no_do += 1;
        let cond = self.parse_expr()?;
        self.no_do -= 1;
        self.eat(&TokenKind::Then);
        let body = self.parse_stmts(&[TokenKind::Else, TokenKind::End])?;
        let else_body = if self.eat(&TokenKind::Else) {
            self.parse_stmts(&[TokenKind::End])?
        } else {
            Vec::new()
        };
        self.expect(&TokenKind::End)?;
        Ok(Expr::If {
            cond: Box::new(cond),
            then_body: else_body,
            else_body: body,
        })
    }

    fn parse_while(&mut self) -> PResult<Expr> {
        self.advance();
        self.no_do += 1;
        let cond = self.parse_expr()?;
        self.no_do -= 1;
        self.eat(&TokenKind::Do);
        self.scope().loop_depth += 1;
        let body = self.parse_stmts(&[TokenKind::End]);
        self.scope().loop_depth -= 1;
        let body = body?;
        self.expect(&TokenKind::End)?;
        Ok(Expr::While {
            cond: Box::new(cond),
            body,
        })
    }

    fn parse_def(&mut self) -> PResult<Expr> {
        self.advance();
        let token = self.advance();
        let mut name = match token.kind {
            TokenKind::Ident(name) | TokenKind::Const(name) => name,
            TokenKind::Plus => "+".into(),
            TokenKind::Minus => "-".into(),
            TokenKind::Star => "*".into(),
            TokenKind::Slash => "/".into(),
            TokenKind::Percent => "%".into(),
            TokenKind::EqEq => "==".into(),
            TokenKind::NotEq => "!=".into(),
            TokenKind::Lt => "<".into(),
            TokenKind::Le => "<=".into(),
            TokenKind::Gt => ">".into(),
            TokenKind::Ge => ">=".into(),
            TokenKind::Shl => "<<".into(),
            TokenKind::LBracket => {
                self.expect(&TokenKind::RBracket)?;
                "[]".into()
            }
            ref other => {
                return Err(self.error_at(&token, format!("syntax error, unexpected {}", describe(other))));
            }
        };
        // Setter: `def name=(v)`
        if self.check(&TokenKind::Assign) && !self.peek().space_before {
            self.advance();
            name.push('=');
        }

        self.scopes.push(Scope::new(ScopeKind::Method));
        let result = self.parse_def_rest(name);
        self.scopes.pop();
        result
    }

    fn parse_def_rest(&mut self, name: String) -> PResult<Expr> {
        let mut params = Vec::new();
        let parens = self.eat(&TokenKind::LParen);
        loop {
            if parens && self.check(&TokenKind::RParen) {
                break;
            }
            match self.kind().clone() {
                TokenKind::Ident(param) => {
                    self.advance();
                    self.scope().locals.insert(param.clone());
                    params.push(param);
                }
                _ if !parens => break,
                _ => return Err(self.unexpected()),
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        if parens {
            self.expect(&TokenKind::RParen)?;
        }
        let body = self.parse_body_with_rescue()?;
        self.expect(&TokenKind::End)?;
        Ok(Expr::Def { name, params, body })
    }

    /// Statements optionally followed by `rescue` clauses, up to `end`.
    fn parse_body_with_rescue(&mut self) -> PResult<Vec<Expr>> {
        let body = self.parse_stmts(&[TokenKind::Rescue, TokenKind::End])?;
        let mut rescues = Vec::new();
        while self.eat(&TokenKind::Rescue) {
            let mut classes = Vec::new();
            while !matches!(
                self.kind(),
                TokenKind::Newline | TokenKind::Semicolon | TokenKind::Arrow | TokenKind::Then | TokenKind::Eof
            ) {
                classes.push(self.parse_or()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            let var = if self.eat(&TokenKind::Arrow) {
                let token = self.advance();
                match token.kind {
                    TokenKind::Ident(name) => {
                        self.declare(&name);
                        Some(name)
                    }
                    ref other => {
                        return Err(self.error_at(&token, format!("syntax error, unexpected {}", describe(other))));
                    }
                }
            } else {
                None
            };
            self.eat(&TokenKind::Then);
            let body = self.parse_stmts(&[TokenKind::Rescue, TokenKind::End])?;
            rescues.push(RescueClause { classes, var, body });
        }
        if rescues.is_empty() {
            Ok(body)
        } else {
            Ok(vec![Expr::Begin { body, rescues }])
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Int(_) => "integer literal".into(),
        TokenKind::Float(_) => "float literal".into(),
        TokenKind::Str(_) => "string literal".into(),
        TokenKind::Ident(name) | TokenKind::Const(name) | TokenKind::Ivar(name) => format!("'{}'", name),
        TokenKind::Symbol(name) => format!("':{}'", name),
        TokenKind::Newline => "end-of-line".into(),
        TokenKind::Eof => "end-of-input".into(),
        other => {
            let text = match other {
                TokenKind::Def => "def",
                TokenKind::End => "end",
                TokenKind::If => "if",
                TokenKind::Elsif => "elsif",
                TokenKind::Else => "else",
                TokenKind::Unless => "unless",
                TokenKind::While => "while",
                TokenKind::Do => "do",
                TokenKind::Then => "then",
                TokenKind::Begin => "begin",
                TokenKind::Rescue => "rescue",
                TokenKind::Return => "return",
                TokenKind::Break => "break",
                TokenKind::Yield => "yield",
                TokenKind::Nil => "nil",
                TokenKind::True => "true",
                TokenKind::False => "false",
                TokenKind::SelfKw => "self",
                TokenKind::Plus => "+",
                TokenKind::Minus => "-",
                TokenKind::Star => "*",
                TokenKind::Slash => "/",
                TokenKind::Percent => "%",
                TokenKind::EqEq => "==",
                TokenKind::NotEq => "!=",
                TokenKind::Lt => "<",
                TokenKind::Le => "<=",
                TokenKind::Gt => ">",
                TokenKind::Ge => ">=",
                TokenKind::Assign => "=",
                TokenKind::PlusAssign => "+=",
                TokenKind::MinusAssign => "-=",
                TokenKind::StarAssign => "*=",
                TokenKind::AndAnd => "&&",
                TokenKind::OrOr => "||",
                TokenKind::Bang => "!",
                TokenKind::Arrow => "=>",
                TokenKind::Shl => "<<",
                TokenKind::LParen => "(",
                TokenKind::RParen => ")",
                TokenKind::LBracket => "[",
                TokenKind::RBracket => "]",
                TokenKind::LBrace => "{",
                TokenKind::RBrace => "}",
                TokenKind::Pipe => "|",
                TokenKind::Comma => ",",
                TokenKind::Dot => ".",
                TokenKind::Semicolon => ";",
                _ => "token",
            };
            format!("'{}'", text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;

    fn parse(src: &str) -> PResult<Vec<Expr>> {
        let (tokens, errors) = Lexer::new(src).tokenize();
        assert!(errors.is_empty(), "lex errors: {:?}", errors);
        Parser::new(tokens).parse_program()
    }

    fn call(recv: Option<Expr>, name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(Call {
            recv: recv.map(Box::new),
            name: name.into(),
            args,
            block: None,
            vcall: false,
        })
    }

    #[test]
    fn test_assignment_makes_identifier_local() {
        let stmts = parse("x = 1\nx").expect("parse");
        assert_eq!(
            stmts,
            vec![
                Expr::AssignLocal("x".into(), Box::new(Expr::Int(1))),
                Expr::Local("x".into()),
            ]
        );
    }

    #[test]
    fn test_unknown_identifier_is_vcall() {
        let stmts = parse("foo").expect("parse");
        assert!(matches!(&stmts[0], Expr::Call(c) if c.vcall && c.name == "foo"));
    }

    #[test]
    fn test_command_call_versus_binary_minus() {
        let stmts = parse("foo -1\nfoo - 1").expect("parse");
        assert_eq!(stmts[0], call(None, "foo", vec![Expr::Int(-1)]));
        assert!(matches!(&stmts[1], Expr::Binary(BinOp::Sub, _, _)));
    }

    #[test]
    fn test_precedence() {
        let stmts = parse("1 + 2 * 3 == 7 && true").expect("parse");
        let Expr::And(lhs, _) = &stmts[0] else {
            panic!("expected &&, got {:?}", stmts[0]);
        };
        let Expr::Binary(BinOp::Eq, sum, _) = &**lhs else {
            panic!("expected ==");
        };
        assert!(matches!(&**sum, Expr::Binary(BinOp::Add, _, rhs) if matches!(&**rhs, Expr::Binary(BinOp::Mul, _, _))));
    }

    #[test]
    fn test_do_block_binds_to_command_call() {
        let stmts = parse("each_pair list do |k, v|\n  k\nend").expect("parse");
        let Expr::Call(outer) = &stmts[0] else {
            panic!("expected call");
        };
        assert_eq!(outer.name, "each_pair");
        let block = outer.block.as_ref().expect("block attached to outer call");
        assert_eq!(block.params, vec!["k".to_string(), "v".to_string()]);
        assert_eq!(block.body, vec![Expr::Local("k".into())]);
    }

    #[test]
    fn test_begin_rescue_with_binding() {
        let stmts = parse("begin\n  raise 'x'\nrescue ArgumentError, TypeError => e\n  e\nend").expect("parse");
        let Expr::Begin { rescues, .. } = &stmts[0] else {
            panic!("expected begin, got {:?}", stmts[0]);
        };
        assert_eq!(rescues.len(), 1);
        assert_eq!(rescues[0].classes.len(), 2);
        assert_eq!(rescues[0].var.as_deref(), Some("e"));
        assert_eq!(rescues[0].body, vec![Expr::Local("e".into())]);
    }

    #[test]
    fn test_statement_modifiers() {
        let stmts = parse("x = 0\nx += 1 while x < 3").expect("parse");
        assert!(matches!(&stmts[1], Expr::While { .. }));
    }

    #[test]
    fn test_index_assignment() {
        let stmts = parse("a = [1]\na[0] = 2").expect("parse");
        assert!(matches!(&stmts[1], Expr::IndexAssign { index, .. } if index.len() == 1));
    }

    #[test]
    fn test_break_outside_loop_is_rejected() {
        let err = parse("break").expect_err("break at top level");
        assert_eq!(err.message, "Invalid break");
        assert_eq!((err.line, err.col), (1, 1));
    }

    #[test]
    fn test_missing_end_reports_end_of_input() {
        let err = parse("def foo\n  1\n").expect_err("missing end");
        assert!(err.message.contains("end-of-input"), "{}", err.message);
    }

    #[test]
    fn test_def_locals_do_not_leak() {
        let stmts = parse("def foo(a)\n  b = a\nend\nb").expect("parse");
        assert!(matches!(&stmts[1], Expr::Call(c) if c.vcall && c.name == "b"));
    }

    #[test]
    fn test_unexpected_tokens_in_names_are_reported() {
        let err = parse("[1].each { |1| 1 }").expect_err("block param");
        assert_eq!(err.message, "syntax error, unexpected integer literal");
        assert_eq!((err.line, err.col), (1, 13));

        let err = parse("def 1\nend").expect_err("method name");
        assert_eq!(err.message, "syntax error, unexpected integer literal");

        let err = parse("begin\n  1\nrescue => :e\nend").expect_err("rescue variable");
        assert_eq!(err.message, "syntax error, unexpected ':e'");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_deeply_nested_brackets_are_rejected() {
        let src = format!("{}1{}", "[".repeat(5000), "]".repeat(5000));
        let err = parse(&src).expect_err("too deep");
        assert_eq!(err.message, "nesting too deep");

        let err = parse(&"(".repeat(200_000)).expect_err("too deep");
        assert_eq!(err.message, "nesting too deep");

        let err = parse(&format!("{}true", "!".repeat(10_000))).expect_err("too deep");
        assert_eq!(err.message, "nesting too deep");
    }

    #[test]
    fn test_moderate_nesting_is_accepted() {
        let src = format!("{}1{}", "[".repeat(50), "]".repeat(50));
        assert!(parse(&src).is_ok());
    }

    #[test]
    fn test_long_operator_chains_are_bounded() {
        let sum = vec!["1"; 300].join(" + ");
        assert!(parse(&sum).is_ok());

        let sum = vec!["1"; 5000].join(" + ");
        let err = parse(&sum).expect_err("too tall");
        assert_eq!(err.message, "nesting too deep");

        let calls = format!("x{}", ".abs".repeat(5000));
        assert!(parse(&calls).is_err());
    }

    #[test]
    fn test_many_statements_do_not_count_as_nesting() {
        let src = "x = 1 + 1\n".repeat(5000);
        assert_eq!(parse(&src).expect("parse").len(), 5000);

        let array = format!("[{}]", vec!["1 + 1"; 5000].join(", "));
        assert!(parse(&array).is_ok());
    }

    #[test]
    fn test_long_elsif_chain_is_rejected_not_overflowed() {
        let src = format!("if false\n1\n{}end", "elsif false\n1\n".repeat(5000));
        let err = parse(&src).expect_err("too deep");
        assert_eq!(err.message, "nesting too deep");
    }
}
