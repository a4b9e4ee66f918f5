//! The built-in tokenizer.
//!
//! In a template context the lexer alternates between raw text and code
//! regions delimited by `{% %}`, `{{ }}` and `{# #}` comments. In program
//! mode (`Context::None`) the whole source is code and newlines insert
//! semicolons after tokens that can end a statement, Go style.
//!
//! The lexer tags every token with the file context; tracking HTML
//! attribute and tag sub-contexts is the job of a context-aware tokenizer
//! outside this crate, driving the parser through the same
//! [`TokenSource`](crate::token::TokenSource) interface.

use vela_core::{Context, Position, VelaError, VelaResult};

use crate::token::{Token, TokenKind, TokenSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Raw template text.
    Text,
    /// Code between `{%` and `%}`.
    Statement,
    /// Code between `{{` and `}}`.
    Value,
    /// Program source.
    Program,
}

/// The built-in lexer.
#[derive(Debug)]
pub struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    line: u32,
    column: u32,
    ctx: Context,
    mode: Mode,
    dollar_identifier: bool,
    /// Kind of the last code token, for semicolon insertion.
    last_kind: Option<TokenKind>,
    eof_done: bool,
}

impl<'src> Lexer<'src> {
    /// Create a lexer over `src` in the given context.
    #[must_use]
    pub fn new(src: &'src [u8], ctx: Context) -> Self {
        let mode = if ctx == Context::None {
            Mode::Program
        } else {
            Mode::Text
        };
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
            ctx,
            mode,
            dollar_identifier: false,
            last_kind: None,
            eof_done: false,
        }
    }

    /// Accept `$`-prefixed identifiers (deprecated form).
    #[must_use]
    pub fn with_dollar_identifier(mut self, enabled: bool) -> Self {
        self.dollar_identifier = enabled;
        self
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    /// Advance one byte, keeping line and column in sync. Columns count
    /// characters, so UTF-8 continuation bytes do not advance them.
    fn bump(&mut self) {
        if let Some(b) = self.peek() {
            self.pos += 1;
            if b == b'\n' {
                self.line += 1;
                self.column = 1;
            } else if b & 0xC0 != 0x80 {
                self.column += 1;
            }
        }
    }

    #[inline]
    fn here(&self) -> (u32, u32, usize) {
        (self.line, self.column, self.pos)
    }

    fn token_from(&self, kind: TokenKind, (line, column, start): (u32, u32, usize)) -> Token {
        let end = self.pos.saturating_sub(1).max(start);
        let txt = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        Token::new(
            kind,
            txt,
            Position::new(line, column, start as u32, end as u32),
            self.ctx,
        )
    }

    fn error_here(&self, message: impl Into<String>) -> VelaError {
        VelaError::syntax(
            Position::at(self.line, self.column, self.pos as u32),
            message,
        )
    }

    fn eof_token(&mut self) -> VelaResult<Token> {
        // Insert the final semicolon a newline would have inserted.
        if self.mode == Mode::Program && self.needs_semicolon() {
            self.last_kind = None;
            return Ok(Token::new(
                TokenKind::Semicolon,
                "",
                Position::at(self.line, self.column, self.pos as u32),
                self.ctx,
            ));
        }
        self.eof_done = true;
        Ok(Token::new(
            TokenKind::Eof,
            "",
            Position::at(self.line, self.column, self.pos as u32),
            self.ctx,
        ))
    }

    fn needs_semicolon(&self) -> bool {
        matches!(
            self.last_kind,
            Some(
                TokenKind::Identifier
                    | TokenKind::Int
                    | TokenKind::Float
                    | TokenKind::InterpretedString
                    | TokenKind::RawString
                    | TokenKind::RightParenthesis
                    | TokenKind::RightBrackets
                    | TokenKind::RightBraces
                    | TokenKind::Increment
                    | TokenKind::Decrement
                    | TokenKind::Break
                    | TokenKind::Continue
            )
        )
    }

    fn next_text(&mut self) -> VelaResult<Token> {
        let start = self.here();
        loop {
            match self.peek() {
                None => break,
                Some(b'{') => match self.peek_at(1) {
                    Some(b'%' | b'{' | b'#') => break,
                    _ => self.bump(),
                },
                Some(_) => self.bump(),
            }
        }
        if self.pos > start.2 {
            return Ok(self.token_from(TokenKind::Text, start));
        }
        // At a delimiter or at the end of the source.
        if self.pos == self.src.len() {
            return self.eof_token();
        }
        match self.peek_at(1) {
            Some(b'%') => {
                self.bump();
                self.bump();
                self.mode = Mode::Statement;
                Ok(self.token_from(TokenKind::StartStatement, start))
            }
            Some(b'{') => {
                self.bump();
                self.bump();
                self.mode = Mode::Value;
                Ok(self.token_from(TokenKind::StartValue, start))
            }
            _ => {
                // {# ... #}
                self.bump();
                self.bump();
                loop {
                    match self.peek() {
                        None => return Err(self.error_here("unexpected EOF, expecting #}")),
                        Some(b'#') if self.peek_at(1) == Some(b'}') => {
                            self.bump();
                            self.bump();
                            break;
                        }
                        Some(_) => self.bump(),
                    }
                }
                Ok(self.token_from(TokenKind::Comment, start))
            }
        }
    }

    fn next_code(&mut self) -> VelaResult<Token> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r') => self.bump(),
                Some(b'\n') => {
                    if self.mode == Mode::Program && self.needs_semicolon() {
                        let start = self.here();
                        self.bump();
                        let mut tok = self.token_from(TokenKind::Semicolon, start);
                        tok.txt = String::new();
                        self.last_kind = None;
                        return Ok(tok);
                    }
                    self.bump();
                }
                Some(b'/') if self.mode == Mode::Program && self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.mode == Mode::Program && self.peek_at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => return Err(self.error_here("unexpected EOF in comment")),
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => self.bump(),
                        }
                    }
                }
                _ => break,
            }
        }

        let start = self.here();
        let Some(b) = self.peek() else {
            if self.mode != Mode::Program {
                let expecting = if self.mode == Mode::Value { "}}" } else { "%}" };
                return Err(self.error_here(format!("unexpected EOF, expecting {expecting}")));
            }
            return self.eof_token();
        };

        // Closing delimiters of the code region.
        if self.mode == Mode::Statement && b == b'%' && self.peek_at(1) == Some(b'}') {
            self.bump();
            self.bump();
            self.mode = Mode::Text;
            self.last_kind = None;
            return Ok(self.token_from(TokenKind::EndStatement, start));
        }
        if self.mode == Mode::Value && b == b'}' && self.peek_at(1) == Some(b'}') {
            self.bump();
            self.bump();
            self.mode = Mode::Text;
            self.last_kind = None;
            return Ok(self.token_from(TokenKind::EndValue, start));
        }

        let tok = match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' | 0x80.. => self.scan_identifier(start),
            b'0'..=b'9' => self.scan_number(start)?,
            b'"' => self.scan_string(start)?,
            b'`' => self.scan_raw_string(start)?,
            b'$' => {
                if !self.dollar_identifier {
                    return Err(self.error_here("unexpected $"));
                }
                self.bump();
                match self.peek() {
                    Some(b'a'..=b'z' | b'A'..=b'Z' | b'_') => {
                        let mut tok = self.scan_identifier(start);
                        tok.kind = TokenKind::Identifier;
                        tok.txt.remove(0);
                        tok
                    }
                    _ => return Err(self.error_here("unexpected $, expecting identifier")),
                }
            }
            _ => self.scan_operator(start)?,
        };
        self.last_kind = Some(tok.kind);
        Ok(tok)
    }

    fn scan_identifier(&mut self, start: (u32, u32, usize)) -> Token {
        while let Some(b) = self.peek() {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | 0x80.. => self.bump(),
                _ => break,
            }
        }
        let mut tok = self.token_from(TokenKind::Identifier, start);
        tok.kind = match tok.txt.as_str() {
            "for" => TokenKind::For,
            "in" if self.mode != Mode::Program => TokenKind::In,
            "range" => TokenKind::Range,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "switch" => TokenKind::Switch,
            "case" => TokenKind::Case,
            "default" => TokenKind::Default,
            "fallthrough" => TokenKind::Fallthrough,
            "type" => TokenKind::Type,
            "package" => TokenKind::Package,
            "go" => TokenKind::Go,
            "import" => TokenKind::Import,
            "include" if self.mode != Mode::Program => TokenKind::Include,
            "show" if self.mode != Mode::Program => TokenKind::Show,
            "macro" if self.mode != Mode::Program => TokenKind::Macro,
            "extends" if self.mode != Mode::Program => TokenKind::Extends,
            "end" if self.mode != Mode::Program => TokenKind::End,
            _ => TokenKind::Identifier,
        };
        tok
    }

    fn scan_number(&mut self, start: (u32, u32, usize)) -> VelaResult<Token> {
        let mut is_float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.bump(),
                b'.' if !is_float && matches!(self.peek_at(1), Some(b'0'..=b'9')) => {
                    is_float = true;
                    self.bump();
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.bump();
                    if matches!(self.peek(), Some(b'+' | b'-')) {
                        self.bump();
                    }
                    if !matches!(self.peek(), Some(b'0'..=b'9')) {
                        return Err(self.error_here("malformed number exponent"));
                    }
                }
                _ => break,
            }
        }
        let kind = if is_float {
            TokenKind::Float
        } else {
            TokenKind::Int
        };
        Ok(self.token_from(kind, start))
    }

    fn scan_string(&mut self, start: (u32, u32, usize)) -> VelaResult<Token> {
        self.bump();
        loop {
            match self.peek() {
                None => return Err(self.error_here("unexpected EOF in string")),
                Some(b'\n') => return Err(self.error_here("newline in string")),
                Some(b'\\') => {
                    self.bump();
                    if self.peek().is_none() {
                        return Err(self.error_here("unexpected EOF in string"));
                    }
                    self.bump();
                }
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(_) => self.bump(),
            }
        }
        Ok(self.token_from(TokenKind::InterpretedString, start))
    }

    fn scan_raw_string(&mut self, start: (u32, u32, usize)) -> VelaResult<Token> {
        self.bump();
        loop {
            match self.peek() {
                None => return Err(self.error_here("unexpected EOF in string")),
                Some(b'`') => {
                    self.bump();
                    break;
                }
                Some(_) => self.bump(),
            }
        }
        Ok(self.token_from(TokenKind::RawString, start))
    }

    fn scan_operator(&mut self, start: (u32, u32, usize)) -> VelaResult<Token> {
        let b = self.peek().unwrap_or(0);
        let b2 = self.peek_at(1);
        let (kind, len) = match (b, b2) {
            (b'.', Some(b'.')) if self.peek_at(2) == Some(b'.') => (TokenKind::Ellipsis, 3),
            (b'&', Some(b'&')) => (TokenKind::And, 2),
            (b'|', Some(b'|')) => (TokenKind::Or, 2),
            (b'=', Some(b'=')) => (TokenKind::Equal, 2),
            (b'!', Some(b'=')) => (TokenKind::NotEqual, 2),
            (b'<', Some(b'=')) => (TokenKind::LessOrEqual, 2),
            (b'>', Some(b'=')) => (TokenKind::GreaterOrEqual, 2),
            (b':', Some(b'=')) => (TokenKind::Declaration, 2),
            (b'+', Some(b'+')) => (TokenKind::Increment, 2),
            (b'-', Some(b'-')) => (TokenKind::Decrement, 2),
            (b';', _) => (TokenKind::Semicolon, 1),
            (b':', _) => (TokenKind::Colon, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b'.', _) => (TokenKind::Period, 1),
            (b'(', _) => (TokenKind::LeftParenthesis, 1),
            (b')', _) => (TokenKind::RightParenthesis, 1),
            (b'[', _) => (TokenKind::LeftBrackets, 1),
            (b']', _) => (TokenKind::RightBrackets, 1),
            (b'{', _) => (TokenKind::LeftBraces, 1),
            (b'}', _) => (TokenKind::RightBraces, 1),
            (b'=', _) => (TokenKind::SimpleAssignment, 1),
            (b'<', _) => (TokenKind::Less, 1),
            (b'>', _) => (TokenKind::Greater, 1),
            (b'+', _) => (TokenKind::Addition, 1),
            (b'-', _) => (TokenKind::Subtraction, 1),
            (b'*', _) => (TokenKind::Multiplication, 1),
            (b'/', _) => (TokenKind::Division, 1),
            (b'%', _) => (TokenKind::Modulo, 1),
            (b'!', _) => (TokenKind::Not, 1),
            _ => {
                return Err(self.error_here(format!(
                    "unexpected character {:?}",
                    char::from(b)
                )))
            }
        };
        for _ in 0..len {
            self.bump();
        }
        Ok(self.token_from(kind, start))
    }
}

impl TokenSource for Lexer<'_> {
    fn next_token(&mut self) -> VelaResult<Token> {
        if self.eof_done {
            return Err(self.error_here("next called after EOF"));
        }
        match self.mode {
            Mode::Text => self.next_text(),
            Mode::Statement | Mode::Value | Mode::Program => self.next_code(),
        }
    }
}
