//! Tokenizer for guest source text.
//!
//! Newlines are significant (they end statements) and are emitted as tokens;
//! the parser skips them wherever an expression must continue. Every token
//! records whether whitespace preceded it, which the parser needs to tell
//! `foo -1` (a command call) from `foo - 1`.

use std::iter::Peekable;
use std::str::Chars;

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Const(String),
    Ivar(String),
    Symbol(String),

    // Keywords
    Def,
    End,
    If,
    Elsif,
    Else,
    Unless,
    While,
    Do,
    Then,
    Begin,
    Rescue,
    Return,
    Break,
    Yield,
    Nil,
    True,
    False,
    SelfKw,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    AndAnd,
    OrOr,
    Bang,
    Arrow,
    Shl,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Pipe,
    Comma,
    Dot,
    Semicolon,
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
    pub space_before: bool,
}

fn keyword(ident: &str) -> Option<TokenKind> {
    Some(match ident {
        "def" => TokenKind::Def,
        "end" => TokenKind::End,
        "if" => TokenKind::If,
        "elsif" => TokenKind::Elsif,
        "else" => TokenKind::Else,
        "unless" => TokenKind::Unless,
        "while" => TokenKind::While,
        "do" => TokenKind::Do,
        "then" => TokenKind::Then,
        "begin" => TokenKind::Begin,
        "rescue" => TokenKind::Rescue,
        "return" => TokenKind::Return,
        "break" => TokenKind::Break,
        "yield" => TokenKind::Yield,
        "nil" => TokenKind::Nil,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "self" => TokenKind::SelfKw,
        _ => return None,
    })
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

pub struct Lexer<'src> {
    chars: Peekable<Chars<'src>>,
    line: usize,
    col: usize,
    errors: Vec<ParseError>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
            errors: Vec::new(),
        }
    }

    /// Tokenize the whole input. Lexical errors are collected, not fatal.
    pub fn tokenize(mut self) -> (Vec<Token>, Vec<ParseError>) {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        (tokens, self.errors)
    }

    #[inline]
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    /// Look one character past `peek`.
    fn peek_next(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&mut self, line: usize, col: usize, message: impl Into<String>) {
        self.errors.push(ParseError {
            line,
            col,
            message: message.into(),
        });
    }

    /// Skip spaces, tabs, comments and escaped newlines. Returns whether
    /// anything was skipped.
    fn skip_whitespace(&mut self) -> bool {
        let mut skipped = false;
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\\' if self.peek_next() == Some('\n') => {
                    self.advance();
                    self.advance();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
            skipped = true;
        }
        skipped
    }

    fn next_token(&mut self) -> Token {
        let space_before = self.skip_whitespace();
        let (line, col) = (self.line, self.col);
        let kind = match self.advance() {
            None => TokenKind::Eof,
            Some(c) => self.scan(c, line, col),
        };
        Token {
            kind,
            line,
            col,
            space_before,
        }
    }

    fn scan(&mut self, c: char, line: usize, col: usize) -> TokenKind {
        match c {
            '\n' => TokenKind::Newline,
            ';' => TokenKind::Semicolon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            '+' if self.eat('=') => TokenKind::PlusAssign,
            '+' => TokenKind::Plus,
            '-' if self.eat('=') => TokenKind::MinusAssign,
            '-' => TokenKind::Minus,
            '*' if self.eat('=') => TokenKind::StarAssign,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' if self.eat('=') => TokenKind::EqEq,
            '=' if self.eat('>') => TokenKind::Arrow,
            '=' => TokenKind::Assign,
            '!' if self.eat('=') => TokenKind::NotEq,
            '!' => TokenKind::Bang,
            '<' if self.eat('=') => TokenKind::Le,
            '<' if self.eat('<') => TokenKind::Shl,
            '<' => TokenKind::Lt,
            '>' if self.eat('=') => TokenKind::Ge,
            '>' => TokenKind::Gt,
            '&' if self.eat('&') => TokenKind::AndAnd,
            '|' if self.eat('|') => TokenKind::OrOr,
            '|' => TokenKind::Pipe,
            '"' | '\'' => self.scan_string(c, line, col),
            ':' => self.scan_symbol(line, col),
            '@' => {
                let name = self.scan_ident_tail(String::from("@"));
                if name.len() == 1 {
                    self.error(line, col, "'@' without identifiers is not allowed as an instance variable name");
                }
                TokenKind::Ivar(name)
            }
            c if c.is_ascii_digit() => self.scan_number(c, line, col),
            c if is_ident_start(c) => {
                let mut name = self.scan_ident_tail(c.to_string());
                if c.is_uppercase() {
                    return TokenKind::Const(name);
                }
                if let Some(kw) = keyword(&name) {
                    return kw;
                }
                // Predicate and bang method names, but not `a!=b`.
                if let Some(suffix @ ('?' | '!')) = self.peek() {
                    if self.peek_next() != Some('=') {
                        self.advance();
                        name.push(suffix);
                    }
                }
                TokenKind::Ident(name)
            }
            other => {
                self.error(line, col, format!("unexpected character '{}'", other));
                self.next_token().kind
            }
        }
    }

    fn scan_ident_tail(&mut self, mut name: String) -> String {
        while let Some(c) = self.peek() {
            if !is_ident_continue(c) {
                break;
            }
            name.push(c);
            self.advance();
        }
        name
    }

    fn scan_symbol(&mut self, line: usize, col: usize) -> TokenKind {
        match self.peek() {
            Some(c) if is_ident_start(c) => {
                self.advance();
                let mut name = self.scan_ident_tail(c.to_string());
                if let Some(suffix @ ('?' | '!' | '=')) = self.peek() {
                    self.advance();
                    name.push(suffix);
                }
                TokenKind::Symbol(name)
            }
            Some(q @ ('"' | '\'')) => {
                self.advance();
                match self.scan_string(q, line, col) {
                    TokenKind::Str(s) => TokenKind::Symbol(s),
                    other => other,
                }
            }
            _ => {
                self.error(line, col, "unexpected ':'");
                TokenKind::Symbol(String::new())
            }
        }
    }

    fn scan_string(&mut self, quote: char, line: usize, col: usize) -> TokenKind {
        let mut s = String::new();
        loop {
            let Some(c) = self.advance() else {
                self.error(line, col, "unterminated string meets end of file");
                break;
            };
            if c == quote {
                break;
            }
            if c != '\\' {
                s.push(c);
                continue;
            }
            let Some(escaped) = self.advance() else {
                self.error(line, col, "unterminated string meets end of file");
                break;
            };
            if quote == '\'' {
                // Single quotes only escape the quote and the backslash.
                if escaped != '\'' && escaped != '\\' {
                    s.push('\\');
                }
                s.push(escaped);
                continue;
            }
            s.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                'e' => '\x1b',
                'x' if self.peek().is_some_and(|c| c.is_ascii_hexdigit()) => {
                    let mut code = 0u32;
                    for _ in 0..2 {
                        match self.peek().and_then(|c| c.to_digit(16)) {
                            Some(d) => {
                                self.advance();
                                code = code * 16 + d;
                            }
                            None => break,
                        }
                    }
                    char::from_u32(code).unwrap_or('\u{fffd}')
                }
                other => other,
            });
        }
        TokenKind::Str(s)
    }

    fn scan_number(&mut self, first: char, line: usize, col: usize) -> TokenKind {
        let mut digits = first.to_string();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.advance();
            } else if c == '_' && self.peek_next().is_some_and(|n| n.is_ascii_digit()) {
                self.advance();
            } else if c == '.' && !is_float && self.peek_next().is_some_and(|n| n.is_ascii_digit()) {
                is_float = true;
                digits.push(c);
                self.advance();
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_next()
                    .is_some_and(|n| n.is_ascii_digit() || n == '-' || n == '+')
            {
                is_float = true;
                digits.push(c);
                self.advance();
                if let Some(sign @ ('-' | '+')) = self.peek() {
                    digits.push(sign);
                    self.advance();
                }
            } else {
                break;
            }
        }

        if is_float {
            match digits.parse::<f64>() {
                Ok(f) => TokenKind::Float(f),
                Err(_) => {
                    self.error(line, col, format!("invalid float literal '{}'", digits));
                    TokenKind::Float(0.0)
                }
            }
        } else {
            match digits.parse::<i64>() {
                Ok(n) => TokenKind::Int(n),
                // Too wide for i64: keep the magnitude as a float.
                Err(_) => TokenKind::Float(digits.parse::<f64>().unwrap_or(f64::INFINITY)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, errors) = Lexer::new(src).tokenize();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_method_call_tokens() {
        assert_eq!(
            kinds("foo.bar?(1, :sym) # trailing"),
            vec![
                TokenKind::Ident("foo".into()),
                TokenKind::Dot,
                TokenKind::Ident("bar?".into()),
                TokenKind::LParen,
                TokenKind::Int(1),
                TokenKind::Comma,
                TokenKind::Symbol("sym".into()),
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_not_equal_after_ident() {
        assert_eq!(
            kinds("a!=b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::NotEq,
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_and_strings() {
        assert_eq!(
            kinds("1_000 2.5 \"a\\tb\" 'c\\n'"),
            vec![
                TokenKind::Int(1000),
                TokenKind::Float(2.5),
                TokenKind::Str("a\tb".into()),
                TokenKind::Str("c\\n".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_space_before_is_recorded() {
        let (tokens, _) = Lexer::new("foo -1").tokenize();
        assert!(tokens[1].space_before);
        assert!(!tokens[2].space_before);
        assert_eq!(tokens[2].col, 6);
    }

    #[test]
    fn test_unterminated_string_is_reported() {
        let (_, errors) = Lexer::new("x = \"open").tokenize();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[0].col, 5);
    }
}
